use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;

use crate::expr::Unit;

/// Errors raised while parsing or evaluating a value expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("parse error at column {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unit mismatch: `{found}` used where `{expected}` is expected")]
    UnitMismatch { expected: Unit, found: Unit },

    #[error("random range is empty: {low} > {high}")]
    Range { low: Decimal, high: Decimal },

    #[error("`{0}` is not available in this expression")]
    UnknownVariable(String),

    #[error("arithmetic overflow in `{0}`")]
    Overflow(String),
}

/// Per-instruction failure. Recorded by the orchestrator, never fatal to the batch.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    UnitMismatch(String),

    #[error("{0}")]
    Range(String),

    #[error("resolved amount is not positive: {0}")]
    NegativeAmount(Decimal),

    #[error("amount {value} is below value_min_limit {limit}")]
    BelowMinLimit { value: u64, limit: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no private key for sender {0}")]
    MissingKey(String),

    #[error("balance query failed: {0}")]
    Query(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("transport failed: {0}")]
    Transport(String),
}

impl TransferError {
    /// Short, stable name used in logs and the final summary.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Parse(_) => "ParseError",
            TransferError::UnitMismatch(_) => "UnitMismatchError",
            TransferError::Range(_) => "RangeError",
            TransferError::NegativeAmount(_) => "NegativeAmountError",
            TransferError::BelowMinLimit { .. } => "BelowMinLimitError",
            TransferError::InvalidAddress(_) => "InvalidAddressError",
            TransferError::MissingKey(_) => "MissingKeyError",
            TransferError::Query(_) => "QueryError",
            TransferError::Signing(_) => "SigningError",
            TransferError::Transport(_) => "TransportError",
        }
    }
}

impl From<ExprError> for TransferError {
    fn from(err: ExprError) -> Self {
        match err {
            ExprError::Parse { .. } => TransferError::Parse(err.to_string()),
            ExprError::UnitMismatch { .. } => TransferError::UnitMismatch(err.to_string()),
            ExprError::Range { .. } | ExprError::Overflow(_) => TransferError::Range(err.to_string()),
            ExprError::UnknownVariable(_) => TransferError::Parse(err.to_string()),
        }
    }
}

/// Fatal errors raised before the batch starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable `{0}` is not set")]
    Env(String),

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("private_keys: no keys configured")]
    EmptyKeys,

    #[error("nodes: no RPC nodes configured")]
    EmptyNodes,
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}
