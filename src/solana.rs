//! RPC-backed capabilities: balances, signing and broadcasting over
//! `solana-client`, with every request routed through the chosen proxy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_rpc_client::http_sender::HttpSender;
use solana_rpc_client::rpc_client::RpcClientConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction,
    transaction::Transaction,
};
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::expr::Unit;
use crate::instruction::{Address, SOL_DECIMALS};
use crate::orchestrator::{BalanceProvider, Broadcaster, TransferSigner};
use crate::pool::Route;
use crate::types::{Confirmation, ResolvedTransfer, to_human};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The SPL mint transfers are made in, with its decimals.
#[derive(Debug, Clone, Copy)]
pub struct TokenMint {
    pub mint: Pubkey,
    pub decimals: u8,
}

#[derive(Debug, Clone)]
pub struct SolanaRpc {
    token: Option<TokenMint>,
    timeout: Duration,
    commitment: CommitmentConfig,
}

impl SolanaRpc {
    pub fn new(token: Option<TokenMint>) -> Self {
        Self {
            token,
            timeout: REQUEST_TIMEOUT,
            commitment: CommitmentConfig::confirmed(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A client for the route's node, behind the route's proxy when set.
    pub fn client(&self, route: &Route) -> Result<RpcClient, String> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = &route.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| format!("bad proxy {proxy}: {e}"))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(|e| e.to_string())?;
        let sender = HttpSender::new_with_client(route.node.clone(), http);
        Ok(RpcClient::new_sender(
            sender,
            RpcClientConfig::with_commitment(self.commitment),
        ))
    }

    pub async fn sol_balance(&self, owner: &Pubkey, route: &Route) -> Result<u64, TransferError> {
        let client = self.client(route).map_err(TransferError::Transport)?;
        client
            .get_balance(owner)
            .await
            .map_err(|e| TransferError::Query(format!("RPC error for {owner}: {e}")))
    }

    /// Balance of the owner's associated token account, in base units.
    pub async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey, route: &Route) -> Result<u64, TransferError> {
        let client = self.client(route).map_err(TransferError::Transport)?;
        let account = get_associated_token_address(owner, mint);
        let amount = client
            .get_token_account_balance(&account)
            .await
            .map_err(|e| TransferError::Query(format!("RPC error for {owner}: {e}")))?;
        amount
            .amount
            .parse::<u64>()
            .map_err(|e| TransferError::Query(format!("bad token amount `{}`: {e}", amount.amount)))
    }

    pub async fn token_decimals(&self, mint: &Pubkey, route: &Route) -> Result<u8, TransferError> {
        let client = self.client(route).map_err(TransferError::Transport)?;
        let supply = client
            .get_token_supply(mint)
            .await
            .map_err(|e| TransferError::Query(format!("can't get decimals for token {mint}: {e}")))?;
        Ok(supply.decimals)
    }

    fn transfer_instructions(&self, transfer: &ResolvedTransfer) -> Result<Vec<Instruction>, TransferError> {
        let from = transfer.from.pubkey();
        let to = transfer.to.pubkey();
        match (transfer.unit, &self.token) {
            (Unit::Sol, _) => Ok(vec![system_instruction::transfer(&from, &to, transfer.amount)]),
            (Unit::Token, Some(token)) => {
                let source = get_associated_token_address(&from, &token.mint);
                let destination = get_associated_token_address(&to, &token.mint);
                let create_destination =
                    create_associated_token_account_idempotent(&from, &to, &token.mint, &spl_token::id());
                let transfer_checked = spl_token::instruction::transfer_checked(
                    &spl_token::id(),
                    &source,
                    &token.mint,
                    &destination,
                    &from,
                    &[],
                    transfer.amount,
                    token.decimals,
                )
                .map_err(|e| TransferError::Signing(e.to_string()))?;
                Ok(vec![create_destination, transfer_checked])
            }
            (Unit::Token, None) => Err(TransferError::Signing("token transfer without a token mint".to_string())),
        }
    }
}

#[async_trait]
impl BalanceProvider for SolanaRpc {
    async fn balance(&self, address: &Address, unit: Unit, route: &Route) -> Result<Decimal, TransferError> {
        let owner = address.pubkey();
        match (unit, &self.token) {
            (Unit::Sol, _) => to_human(self.sol_balance(&owner, route).await?, SOL_DECIMALS),
            (Unit::Token, Some(token)) => {
                let amount = self.token_balance(&owner, &token.mint, route).await?;
                to_human(amount, u32::from(token.decimals))
            }
            (Unit::Token, None) => Err(TransferError::Query("token balance requested without a token".to_string())),
        }
    }
}

#[async_trait]
impl TransferSigner for SolanaRpc {
    async fn sign(
        &self,
        transfer: &ResolvedTransfer,
        keypair: &Keypair,
        route: &Route,
    ) -> Result<Transaction, TransferError> {
        let instructions = self.transfer_instructions(transfer)?;
        let client = self.client(route).map_err(TransferError::Transport)?;
        let recent_blockhash = client
            .get_latest_blockhash()
            .await
            .map_err(|e| TransferError::Signing(format!("failed to get recent blockhash: {e}")))?;

        let payer = keypair.pubkey();
        let mut transaction = Transaction::new_with_payer(&instructions, Some(&payer));
        transaction
            .try_sign(&[keypair], recent_blockhash)
            .map_err(|e| TransferError::Signing(e.to_string()))?;
        Ok(transaction)
    }
}

#[async_trait]
impl Broadcaster for SolanaRpc {
    async fn submit(&self, transaction: &Transaction, route: &Route) -> Result<Signature, TransferError> {
        let client = self.client(route).map_err(TransferError::Transport)?;
        debug!(node = %route.node, "sending transaction");
        client
            .send_transaction_with_config(
                transaction,
                RpcSendTransactionConfig {
                    skip_preflight: false,
                    preflight_commitment: Some(self.commitment.commitment),
                    encoding: None,
                    max_retries: Some(5),
                    min_context_slot: None,
                },
            )
            .await
            .map_err(|e| TransferError::Transport(format!("send error: {e}")))
    }

    async fn confirm(
        &self,
        signature: &Signature,
        route: &Route,
        timeout: Duration,
    ) -> Result<Confirmation, TransferError> {
        let client = match self.client(route) {
            Ok(client) => client,
            Err(e) => {
                warn!("can't check signature status: {e}");
                return Ok(Confirmation::Unconfirmed);
            }
        };
        let end_time = Instant::now() + timeout;

        while Instant::now() < end_time {
            match client.get_signature_status(signature).await {
                Ok(Some(Ok(()))) => return Ok(Confirmation::Confirmed),
                Ok(Some(Err(e))) => {
                    return Err(TransferError::Transport(format!("transaction {signature} failed: {e:?}")));
                }
                Ok(None) => sleep(Duration::from_millis(500)).await,
                Err(e) => {
                    warn!("error checking signature status: {e}");
                    sleep(Duration::from_millis(1000)).await;
                }
            }
        }
        Ok(Confirmation::Unconfirmed)
    }
}

/// Resolves a mint from its config form.
pub fn token_mint(address: &Address, decimals: u8) -> TokenMint {
    TokenMint {
        mint: address.pubkey(),
        decimals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FROM: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const TO: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn transfer(unit: Unit, amount: u64, decimals: u32) -> ResolvedTransfer {
        ResolvedTransfer {
            from: Address::parse(FROM).unwrap(),
            to: Address::parse(TO).unwrap(),
            amount,
            unit,
            decimals,
        }
    }

    #[test]
    fn sol_transfer_is_a_system_transfer() {
        let rpc = SolanaRpc::new(None);
        let instructions = rpc.transfer_instructions(&transfer(Unit::Sol, 42, 9)).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].program_id, solana_sdk::system_program::id());
    }

    #[test]
    fn token_transfer_creates_destination_and_transfers_checked() {
        let mint = token_mint(&Address::parse(USDC).unwrap(), 6);
        let rpc = SolanaRpc::new(Some(mint));
        let instructions = rpc.transfer_instructions(&transfer(Unit::Token, 1_200_000, 6)).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].program_id, spl_associated_token_account::id());
        assert_eq!(instructions[1].program_id, spl_token::id());
    }

    #[test]
    fn token_transfer_without_mint_fails() {
        let rpc = SolanaRpc::new(None);
        assert!(matches!(
            rpc.transfer_instructions(&transfer(Unit::Token, 1, 6)),
            Err(TransferError::Signing(_))
        ));
    }

    #[test]
    fn client_rejects_bad_proxy() {
        let rpc = SolanaRpc::new(None);
        let route = Route {
            node: "http://127.0.0.1:8899".to_string(),
            proxy: Some("::not a proxy::".to_string()),
        };
        assert!(rpc.client(&route).is_err());
        let direct = Route {
            node: "http://127.0.0.1:8899".to_string(),
            proxy: None,
        };
        assert!(rpc.client(&direct).is_ok());
    }
}
