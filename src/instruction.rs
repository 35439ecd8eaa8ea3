use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Serialize, Serializer};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ConfigError, TransferError};
use crate::expr::{Unit, ValueExpr};
use crate::orchestrator::BalanceProvider;
use crate::pool::Route;
use crate::types::{ResolvedTransfer, to_human};

const PUBKEY_BYTES: usize = 32;

/// Flat fee of a single-signature transaction, kept back from `balance` in SOL mode.
pub const TRANSFER_FEE_LAMPORTS: u64 = 5_000;

pub const SOL_DECIMALS: u32 = 9;

/// Upper bound for mint decimals; amounts must stay representable as `Decimal`.
pub const MAX_TOKEN_DECIMALS: u32 = 18;

/// A base58 public key, validated by its decoded length only.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    text: String,
    bytes: [u8; PUBKEY_BYTES],
}

impl Address {
    pub fn parse(text: &str) -> Result<Self, TransferError> {
        let decoded = bs58::decode(text)
            .into_vec()
            .map_err(|e| TransferError::InvalidAddress(format!("{text}: {e}")))?;
        let bytes: [u8; PUBKEY_BYTES] = decoded.try_into().map_err(|v: Vec<u8>| {
            TransferError::InvalidAddress(format!("{text}: decodes to {} bytes, expected {PUBKEY_BYTES}", v.len()))
        })?;
        Ok(Self {
            text: text.to_string(),
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.bytes)
    }
}

impl From<Pubkey> for Address {
    fn from(pubkey: Pubkey) -> Self {
        Self {
            text: pubkey.to_string(),
            bytes: pubkey.to_bytes(),
        }
    }
}

impl FromStr for Address {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.text)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

/// One `<from> <to> [<value-expression>]` line. Addresses are checked at resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInstruction {
    pub from: String,
    pub to: String,
    pub value: Option<ValueExpr>,
}

impl TransferInstruction {
    pub fn parse(line: &str) -> Result<Self, TransferError> {
        let mut fields = line.split_whitespace();
        let (Some(from), Some(to)) = (fields.next(), fields.next()) else {
            return Err(TransferError::Parse(format!(
                "expected `<from> <to> [<value>]`, got `{line}`"
            )));
        };
        let rest: Vec<&str> = fields.collect();
        let value = if rest.is_empty() {
            None
        } else {
            Some(ValueExpr::parse(&rest.join(" "))?)
        };
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            value,
        })
    }
}

/// A configured transfer line and its parse result.
#[derive(Debug, Clone)]
pub struct InstructionLine {
    pub index: usize,
    pub text: String,
    pub parsed: Result<TransferInstruction, TransferError>,
}

impl InstructionLine {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let parsed = TransferInstruction::parse(&text);
        Self { index, text, parsed }
    }

    /// `n: from->to`, used as the log prefix for this instruction.
    pub fn log_prefix(&self) -> String {
        match &self.parsed {
            Ok(instruction) => format!("{}: {}->{}", self.index, instruction.from, instruction.to),
            Err(_) => format!("{}: `{}`", self.index, self.text),
        }
    }
}

/// Turns instructions into concrete transfers in the ledger's smallest unit.
#[derive(Debug, Clone)]
pub struct InstructionResolver {
    unit: Unit,
    decimals: u32,
    default_value: Option<ValueExpr>,
    value_min_limit: Option<ValueExpr>,
}

impl InstructionResolver {
    /// Native SOL transfers.
    pub fn sol(default_value: Option<ValueExpr>, value_min_limit: Option<ValueExpr>) -> Self {
        Self {
            unit: Unit::Sol,
            decimals: SOL_DECIMALS,
            default_value,
            value_min_limit,
        }
    }

    /// Token transfers with the mint's decimal precision.
    pub fn token(
        decimals: u32,
        default_value: Option<ValueExpr>,
        value_min_limit: Option<ValueExpr>,
    ) -> Result<Self, ConfigError> {
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(ConfigError::invalid(
                "token_decimals",
                format!("{decimals} is above {MAX_TOKEN_DECIMALS}"),
            ));
        }
        Ok(Self {
            unit: Unit::Token,
            decimals,
            default_value,
            value_min_limit,
        })
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// The expression an instruction will be evaluated with.
    pub fn value_expr<'a>(&'a self, instruction: &'a TransferInstruction) -> Option<&'a ValueExpr> {
        instruction.value.as_ref().or(self.default_value.as_ref())
    }

    /// Resolves one instruction. The balance is queried only when the
    /// chosen expression references `balance`.
    pub async fn resolve<B, R>(
        &self,
        instruction: &TransferInstruction,
        balances: &B,
        route: &Route,
        rng: &mut R,
    ) -> Result<ResolvedTransfer, TransferError>
    where
        B: BalanceProvider + ?Sized,
        R: Rng + Send + ?Sized,
    {
        let from = Address::parse(&instruction.from)?;
        let to = Address::parse(&instruction.to)?;
        let expr = self
            .value_expr(instruction)
            .ok_or_else(|| TransferError::Parse("value is not set and default_value is empty".to_string()))?;
        expr.ensure_unit(self.unit)?;

        let balance = if expr.references_balance() {
            let balance = balances.balance(&from, self.unit, route).await?;
            Some(self.spendable(balance)?)
        } else {
            None
        };

        let value = expr.evaluate(balance, rng)?;
        let amount = self.to_base_units(value)?;
        debug!(%from, %to, expr = %expr, ?balance, %value, amount, "resolved transfer value");

        if let Some(limit_expr) = &self.value_min_limit {
            let limit = limit_expr.evaluate(None, rng)?;
            let limit = self.to_base_units(limit)?;
            if amount < limit {
                return Err(TransferError::BelowMinLimit { value: amount, limit });
            }
        }

        Ok(ResolvedTransfer {
            from,
            to,
            amount,
            unit: self.unit,
            decimals: self.decimals,
        })
    }

    fn spendable(&self, balance: Decimal) -> Result<Decimal, TransferError> {
        match self.unit {
            Unit::Sol => Ok(balance
                .saturating_sub(to_human(TRANSFER_FEE_LAMPORTS, SOL_DECIMALS)?)
                .max(Decimal::ZERO)),
            Unit::Token => Ok(balance),
        }
    }

    /// Truncates toward zero; non-positive results fail.
    pub fn to_base_units(&self, value: Decimal) -> Result<u64, TransferError> {
        let scale = 10i128
            .checked_pow(self.decimals)
            .and_then(|pow| Decimal::try_from_i128_with_scale(pow, 0).ok())
            .ok_or_else(|| TransferError::Range(format!("{} decimals are out of range", self.decimals)))?;
        let scaled = value
            .checked_mul(scale)
            .ok_or_else(|| TransferError::Range(format!("amount {value} overflows")))?
            .trunc();
        if scaled <= Decimal::ZERO {
            return Err(TransferError::NegativeAmount(value));
        }
        scaled
            .to_u64()
            .ok_or_else(|| TransferError::Range(format!("amount {value} does not fit into u64")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Mutex;

    const A: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const B: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";

    struct FixedBalance {
        balance: Decimal,
        queries: Mutex<Vec<(String, Unit)>>,
    }

    impl FixedBalance {
        fn new(balance: &str) -> Self {
            Self {
                balance: Decimal::from_str(balance).unwrap(),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BalanceProvider for FixedBalance {
        async fn balance(&self, address: &Address, unit: Unit, _route: &Route) -> Result<Decimal, TransferError> {
            self.queries.lock().unwrap().push((address.to_string(), unit));
            Ok(self.balance)
        }
    }

    fn route() -> Route {
        Route {
            node: "http://localhost:8899".to_string(),
            proxy: None,
        }
    }

    fn instruction(line: &str) -> TransferInstruction {
        TransferInstruction::parse(line).unwrap()
    }

    fn expr(src: &str) -> Option<ValueExpr> {
        Some(ValueExpr::parse(src).unwrap())
    }

    #[test]
    fn address_validation_is_structural() {
        assert!(Address::parse(A).is_ok());
        assert!(matches!(Address::parse("not-base58!"), Err(TransferError::InvalidAddress(_))));
        assert!(matches!(Address::parse("3mJr7AoUXx2Wqd"), Err(TransferError::InvalidAddress(_))));
        assert_eq!(Address::parse(A).unwrap().pubkey().to_string(), A);
    }

    #[test]
    fn instruction_line_grammar() {
        let parsed = instruction(&format!("{A} {B} 0.6balance - random(1t, 2.50t) - 100"));
        assert_eq!(parsed.from, A);
        assert_eq!(parsed.to, B);
        assert_eq!(parsed.value.unwrap().source(), "0.6balance - random(1t, 2.50t) - 100");

        assert!(instruction(&format!("{A} {B}")).value.is_none());
        assert!(matches!(TransferInstruction::parse(A), Err(TransferError::Parse(_))));
        assert!(matches!(
            TransferInstruction::parse(&format!("{A} {B} 1 * 2")),
            Err(TransferError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn literal_token_amount_skips_balance_query() {
        let resolver = InstructionResolver::token(6, expr("5t"), None).unwrap();
        let balances = FixedBalance::new("0");
        let mut rng = StdRng::seed_from_u64(1);

        let resolved = resolver
            .resolve(&instruction(&format!("{A} {B} 1.2t")), &balances, &route(), &mut rng)
            .await
            .unwrap();

        assert_eq!(resolved.amount, 1_200_000);
        assert_eq!(resolved.unit, Unit::Token);
        assert_eq!(balances.query_count(), 0);
    }

    #[tokio::test]
    async fn explicit_value_ignores_default() {
        let resolver = InstructionResolver::token(6, expr("balance"), None).unwrap();
        let balances = FixedBalance::new("1000");
        let mut rng = StdRng::seed_from_u64(1);

        let resolved = resolver
            .resolve(&instruction(&format!("{A} {B} 2t")), &balances, &route(), &mut rng)
            .await
            .unwrap();
        assert_eq!(resolved.amount, 2_000_000);
        assert_eq!(balances.query_count(), 0);
    }

    #[tokio::test]
    async fn default_value_with_balance_and_random() {
        let resolver = InstructionResolver::token(6, expr("0.2balance+random(1t,2.50t)-100"), None).unwrap();
        let balances = FixedBalance::new("1000");
        let mut rng = StdRng::seed_from_u64(9);

        for _ in 0..50 {
            let resolved = resolver
                .resolve(&instruction(&format!("{A} {B}")), &balances, &route(), &mut rng)
                .await
                .unwrap();
            assert!((101_000_000..=102_500_000).contains(&resolved.amount), "{}", resolved.amount);
        }
        assert_eq!(balances.query_count(), 50);
        assert_eq!(balances.queries.lock().unwrap()[0], (A.to_string(), Unit::Token));
    }

    #[tokio::test]
    async fn negative_result_fails() {
        let resolver = InstructionResolver::token(6, None, None).unwrap();
        let balances = FixedBalance::new("10");
        let mut rng = StdRng::seed_from_u64(2);

        let err = resolver
            .resolve(
                &instruction(&format!("{A} {B} 0.6balance-random(1t,2.50t)-100")),
                &balances,
                &route(),
                &mut rng,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NegativeAmount(_)));
    }

    #[tokio::test]
    async fn sol_balance_keeps_fee_reserve() {
        let resolver = InstructionResolver::sol(None, None);
        let balances = FixedBalance::new("1");
        let mut rng = StdRng::seed_from_u64(2);

        let resolved = resolver
            .resolve(&instruction(&format!("{A} {B} balance")), &balances, &route(), &mut rng)
            .await
            .unwrap();
        assert_eq!(resolved.amount, 1_000_000_000 - TRANSFER_FEE_LAMPORTS);
        assert_eq!(resolved.unit, Unit::Sol);
    }

    #[tokio::test]
    async fn unit_and_address_errors() {
        let resolver = InstructionResolver::sol(None, None);
        let balances = FixedBalance::new("1");
        let mut rng = StdRng::seed_from_u64(2);

        let err = resolver
            .resolve(&instruction(&format!("{A} {B} 1t")), &balances, &route(), &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnitMismatch(_)));

        let err = resolver
            .resolve(&instruction(&format!("{A} nope 1")), &balances, &route(), &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidAddress(_)));

        let err = resolver
            .resolve(&instruction(&format!("{A} {B}")), &balances, &route(), &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Parse(_)));
    }

    #[test]
    fn token_decimals_are_bounded() {
        assert!(InstructionResolver::token(MAX_TOKEN_DECIMALS, None, None).is_ok());
        for decimals in [MAX_TOKEN_DECIMALS + 1, 30, 255] {
            assert!(matches!(
                InstructionResolver::token(decimals, None, None),
                Err(ConfigError::Invalid {
                    field: "token_decimals",
                    ..
                })
            ));
        }
        let resolver = InstructionResolver::token(MAX_TOKEN_DECIMALS, None, None).unwrap();
        assert_eq!(resolver.to_base_units(Decimal::ONE).unwrap(), 10u64.pow(MAX_TOKEN_DECIMALS));
    }

    #[tokio::test]
    async fn arithmetic_overflow_fails_the_instruction() {
        let resolver = InstructionResolver::sol(None, None);
        let balances = FixedBalance::new("100");
        let mut rng = StdRng::seed_from_u64(2);

        let err = resolver
            .resolve(
                &instruction(&format!("{A} {B} 79228162514264337593543950335 + 1")),
                &balances,
                &route(),
                &mut rng,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RangeError");

        let err = resolver
            .resolve(&instruction(&format!("{A} {B} 1000000000000sol")), &balances, &route(), &mut rng)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RangeError");
    }

    #[tokio::test]
    async fn value_min_limit_rejects_small_amounts() {
        let resolver = InstructionResolver::sol(None, expr("0.5"));
        let balances = FixedBalance::new("1");
        let mut rng = StdRng::seed_from_u64(2);

        let err = resolver
            .resolve(&instruction(&format!("{A} {B} 0.1sol")), &balances, &route(), &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::BelowMinLimit {
                value: 100_000_000,
                limit: 500_000_000
            }
        ));

        let resolved = resolver
            .resolve(&instruction(&format!("{A} {B} 0.5sol")), &balances, &route(), &mut rng)
            .await
            .unwrap();
        assert_eq!(resolved.amount, 500_000_000);
    }
}
