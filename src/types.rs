use rust_decimal::Decimal;
use solana_sdk::signature::Signature;
use std::time::Duration;

use crate::error::TransferError;
use crate::expr::Unit;
use crate::instruction::Address;

/// An instruction with a concrete amount in the smallest ledger unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransfer {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub unit: Unit,
    pub decimals: u32,
}

impl ResolvedTransfer {
    /// Amount in human units (SOL or token).
    pub fn human_amount(&self) -> Result<Decimal, TransferError> {
        to_human(self.amount, self.decimals)
    }

    pub fn display_amount(&self, ndigits: u32) -> String {
        match self.human_amount() {
            Ok(amount) => format!("{}{}", amount.round_dp(ndigits).normalize(), self.unit),
            Err(_) => format!("{}e-{}{}", self.amount, self.decimals, self.unit),
        }
    }
}

/// Base units to human units. Fails for scales `Decimal` can't represent.
pub fn to_human(base_units: u64, decimals: u32) -> Result<Decimal, TransferError> {
    Decimal::try_from_i128_with_scale(i128::from(base_units), decimals)
        .map_err(|e| TransferError::Range(format!("{base_units} with {decimals} decimals: {e}")))
}

/// Where an instruction was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Dispatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Unconfirmed,
    Skipped,
}

#[derive(Debug, Clone)]
pub enum TransferStatus {
    Succeeded {
        signature: Signature,
        confirmation: Confirmation,
    },
    Emulated,
    Failed {
        stage: Stage,
        error: TransferError,
    },
    Cancelled,
}

impl TransferStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TransferStatus::Succeeded {
                confirmation: Confirmation::Confirmed,
                ..
            } => "OK",
            TransferStatus::Succeeded { .. } => "SENT",
            TransferStatus::Emulated => "EMULATED",
            TransferStatus::Failed { .. } => "FAILED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Succeeded { .. } | TransferStatus::Emulated)
    }
}

/// Outcome of one instruction in a batch run.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub index: usize,
    pub line: String,
    pub transfer: Option<ResolvedTransfer>,
    pub status: TransferStatus,
    pub duration_ms: u64,
}

impl TransferRecord {
    pub fn error(&self) -> Option<&TransferError> {
        match &self.status {
            TransferStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub records: Vec<TransferRecord>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn cancelled(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, TransferStatus::Cancelled))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TransferRecord, &TransferError)> {
        self.records.iter().filter_map(|r| r.error().map(|e| (r, e)))
    }

    /// True only when every instruction succeeded (or was emulated).
    pub fn is_success(&self) -> bool {
        self.records.iter().all(|r| r.status.is_success())
    }
}
