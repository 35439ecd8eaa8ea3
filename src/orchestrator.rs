//! The batch loop.
//!
//! Instructions run one at a time in configuration order. Each instruction
//! takes one route (node + proxy), is resolved to a concrete amount, signed
//! with the sender's key and submitted. Failures are recorded and the loop
//! moves on; the delay applies between instructions only.

use async_trait::async_trait;
use indicatif::ProgressBar;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::transaction::Transaction;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delay::DelayScheduler;
use crate::error::TransferError;
use crate::expr::Unit;
use crate::instruction::{Address, InstructionLine, InstructionResolver};
use crate::keys::KeyPool;
use crate::pool::{Route, Routes};
use crate::types::{BatchSummary, Confirmation, ResolvedTransfer, Stage, TransferRecord, TransferStatus};

/// Live balance lookup, in human units of `unit`.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn balance(&self, address: &Address, unit: Unit, route: &Route) -> Result<Decimal, TransferError>;
}

/// Builds and signs the ledger transaction for a resolved transfer.
#[async_trait]
pub trait TransferSigner: Send + Sync {
    async fn sign(
        &self,
        transfer: &ResolvedTransfer,
        keypair: &Keypair,
        route: &Route,
    ) -> Result<Transaction, TransferError>;
}

/// Submits signed transactions through a node, optionally behind a proxy.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn submit(&self, transaction: &Transaction, route: &Route) -> Result<Signature, TransferError>;

    /// `Unconfirmed` when the signature was not seen within `timeout` or the
    /// node could not be asked; `Err` when the transaction executed and failed.
    async fn confirm(
        &self,
        signature: &Signature,
        route: &Route,
        timeout: Duration,
    ) -> Result<Confirmation, TransferError>;
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub emulate: bool,
    pub confirm: bool,
    pub confirm_timeout: Duration,
    pub round_ndigits: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            emulate: false,
            confirm: true,
            confirm_timeout: Duration::from_secs(30),
            round_ndigits: 5,
        }
    }
}

pub struct TransferOrchestrator<C> {
    resolver: InstructionResolver,
    keys: KeyPool,
    routes: Routes,
    delay: DelayScheduler,
    options: BatchOptions,
    chain: C,
    rng: StdRng,
    progress: ProgressBar,
}

impl<C> TransferOrchestrator<C>
where
    C: BalanceProvider + TransferSigner + Broadcaster,
{
    pub fn new(resolver: InstructionResolver, keys: KeyPool, routes: Routes, delay: DelayScheduler, chain: C) -> Self {
        Self {
            resolver,
            keys,
            routes,
            delay,
            options: BatchOptions::default(),
            chain,
            rng: StdRng::from_entropy(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Runs every instruction once. Cancellation is honoured at the delay
    /// and before each dispatch; an in-flight submission always completes.
    pub async fn run(&mut self, instructions: &[InstructionLine], cancel: &CancellationToken) -> BatchSummary {
        let started = Instant::now();
        let mut records = Vec::with_capacity(instructions.len());
        self.progress.set_length(instructions.len() as u64);

        for (position, line) in instructions.iter().enumerate() {
            if position > 0 && self.delay.is_enabled() {
                let duration = self.delay.next(&mut self.rng);
                info!("delay {} seconds", duration.as_secs());
                if !self.options.emulate && self.delay.wait(duration, cancel).await.is_err() {
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let record = self.dispatch(line, cancel).await;
            self.log_outcome(line, &record);
            self.progress.inc(1);
            records.push(record);
        }

        if records.len() < instructions.len() {
            warn!(
                "batch cancelled, {} instructions not attempted",
                instructions.len() - records.len()
            );
            for line in &instructions[records.len()..] {
                records.push(TransferRecord {
                    index: line.index,
                    line: line.text.clone(),
                    transfer: None,
                    status: TransferStatus::Cancelled,
                    duration_ms: 0,
                });
            }
        }

        self.progress.finish_and_clear();
        BatchSummary {
            records,
            elapsed: started.elapsed(),
        }
    }

    async fn dispatch(&mut self, line: &InstructionLine, cancel: &CancellationToken) -> TransferRecord {
        let started = Instant::now();
        let route = self.routes.next_route();
        debug!(node = %route.node, proxy = ?route.proxy, "{}: route selected", line.log_prefix());

        let (transfer, status) = self.execute(line, &route, cancel).await;
        TransferRecord {
            index: line.index,
            line: line.text.clone(),
            transfer,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn execute(
        &mut self,
        line: &InstructionLine,
        route: &Route,
        cancel: &CancellationToken,
    ) -> (Option<ResolvedTransfer>, TransferStatus) {
        let instruction = match &line.parsed {
            Ok(instruction) => instruction,
            Err(error) => {
                return (
                    None,
                    TransferStatus::Failed {
                        stage: Stage::Resolving,
                        error: error.clone(),
                    },
                );
            }
        };

        debug!("{}: resolving", line.log_prefix());
        let transfer = match self
            .resolver
            .resolve(instruction, &self.chain, route, &mut self.rng)
            .await
        {
            Ok(transfer) => transfer,
            Err(error) => {
                return (
                    None,
                    TransferStatus::Failed {
                        stage: Stage::Resolving,
                        error,
                    },
                );
            }
        };

        debug!(
            "{}: dispatching {}",
            line.log_prefix(),
            transfer.display_amount(self.options.round_ndigits)
        );
        let status = match self.send(&transfer, route, cancel).await {
            Ok(status) => status,
            Err(error) => TransferStatus::Failed {
                stage: Stage::Dispatching,
                error,
            },
        };
        (Some(transfer), status)
    }

    async fn send(
        &self,
        transfer: &ResolvedTransfer,
        route: &Route,
        cancel: &CancellationToken,
    ) -> Result<TransferStatus, TransferError> {
        let keypair = self.keys.get(&transfer.from)?;
        if self.options.emulate {
            return Ok(TransferStatus::Emulated);
        }

        let transaction = self.chain.sign(transfer, keypair, route).await?;
        let signature = self.chain.submit(&transaction, route).await?;

        let confirmation = if !self.options.confirm {
            Confirmation::Skipped
        } else {
            debug!(%signature, "waiting for confirmation");
            tokio::select! {
                confirmation = self.chain.confirm(&signature, route, self.options.confirm_timeout) => confirmation?,
                _ = cancel.cancelled() => {
                    warn!(%signature, "batch cancelled while waiting for confirmation");
                    Confirmation::Unconfirmed
                }
            }
        };

        Ok(TransferStatus::Succeeded {
            signature,
            confirmation,
        })
    }

    fn log_outcome(&self, line: &InstructionLine, record: &TransferRecord) {
        let prefix = line.log_prefix();
        let value = record
            .transfer
            .as_ref()
            .map(|t| t.display_amount(self.options.round_ndigits))
            .unwrap_or_default();
        match &record.status {
            TransferStatus::Succeeded { signature, .. } => {
                info!(
                    "{prefix}: sig={signature}, value={value}, status={}",
                    record.status.label()
                );
            }
            TransferStatus::Emulated => info!("{prefix}: emulate, value={value}"),
            TransferStatus::Failed { stage, error } => {
                warn!("{prefix}: {} while {:?}: {error}", error.kind(), stage);
            }
            TransferStatus::Cancelled => {}
        }
    }
}
