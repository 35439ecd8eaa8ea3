use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ConfigError;
use crate::expr::ValueExpr;

/// Returned when the batch was cancelled during a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Pacing between transfers, in whole seconds.
#[derive(Debug, Clone, Default)]
pub struct DelayScheduler {
    expr: Option<ValueExpr>,
}

impl DelayScheduler {
    pub fn new(expr: Option<ValueExpr>) -> Result<Self, ConfigError> {
        if let Some(expr) = &expr {
            if expr.references_balance() {
                return Err(ConfigError::invalid("delay", "`balance` is not allowed in delay"));
            }
            if let Some(unit) = expr.unit() {
                return Err(ConfigError::invalid("delay", format!("delay is in seconds, `{unit}` is not allowed")));
            }
        }
        Ok(Self { expr })
    }

    pub fn is_enabled(&self) -> bool {
        self.expr.is_some()
    }

    /// A fresh draw, floored to whole seconds and never negative.
    pub fn next<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let Some(expr) = &self.expr else {
            return Duration::ZERO;
        };
        let seconds = match expr.evaluate(None, rng) {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!("can't evaluate delay `{expr}`, not waiting: {e}");
                Decimal::ZERO
            }
        };
        let seconds = seconds.floor().max(Decimal::ZERO);
        Duration::from_secs(seconds.to_u64().unwrap_or(u64::MAX))
    }

    /// Sleeps for `duration` unless the batch is cancelled first.
    pub async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if duration.is_zero() {
            return if cancel.is_cancelled() { Err(Cancelled) } else { Ok(()) };
        }
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }
}
