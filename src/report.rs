use std::fmt::Write;

use crate::expr::Unit;
use crate::instruction::{Address, InstructionLine, InstructionResolver, SOL_DECIMALS};
use crate::pool::Routes;
use crate::solana::SolanaRpc;
use crate::types::{BatchSummary, TransferStatus, to_human};

pub fn render_summary(summary: &BatchSummary, ndigits: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{:-^100}", " RESULTS SUMMARY ");
    let _ = writeln!(
        out,
        "{:<5} {:<10} {:<20} {:<10} {:<44} {}",
        "No.", "Status", "Value", "Time (ms)", "From", "Signature / Error"
    );
    let _ = writeln!(out, "{:-^100}", "");

    for record in &summary.records {
        let value = record
            .transfer
            .as_ref()
            .map(|t| t.display_amount(ndigits))
            .unwrap_or_else(|| "-".to_string());
        let from = record
            .transfer
            .as_ref()
            .map(|t| t.from.to_string())
            .or_else(|| record.line.split_whitespace().next().map(str::to_string))
            .unwrap_or_default();
        let detail = match &record.status {
            TransferStatus::Succeeded { signature, .. } => signature.to_string(),
            TransferStatus::Failed { error, .. } => format!("{}: {error}", error.kind()),
            TransferStatus::Emulated | TransferStatus::Cancelled => String::new(),
        };
        let _ = writeln!(
            out,
            "{:<5} {:<10} {:<20} {:<10} {:<44} {}",
            record.index,
            record.status.label(),
            value,
            record.duration_ms,
            from,
            detail
        );
    }

    let _ = writeln!(out, "\n{:-^100}", " STATISTICS ");
    let _ = writeln!(out, "Total transfers: {}", summary.total());
    let _ = writeln!(out, "Successful: {}", summary.succeeded());
    let _ = writeln!(out, "Failed: {}", summary.failed());
    let _ = writeln!(out, "Cancelled: {}", summary.cancelled());
    let _ = writeln!(out, "Total execution time: {}ms", summary.elapsed.as_millis());
    out
}

pub fn render_transfers(instructions: &[InstructionLine], resolver: &InstructionResolver) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<5} {:<44} {:<44} {}", "n", "from_address", "to_address", "value");
    for line in instructions {
        match &line.parsed {
            Ok(instruction) => {
                let value = resolver
                    .value_expr(instruction)
                    .map(|expr| expr.source().to_string())
                    .unwrap_or_else(|| "<not set>".to_string());
                let _ = writeln!(
                    out,
                    "{:<5} {:<44} {:<44} {}",
                    line.index, instruction.from, instruction.to, value
                );
            }
            Err(error) => {
                let _ = writeln!(out, "{:<5} {error}", line.index);
            }
        }
    }
    out
}

/// SOL (and token) balances of every sender and recipient.
pub async fn render_balances(
    instructions: &[InstructionLine],
    rpc: &SolanaRpc,
    routes: &mut Routes,
    token: Option<(&Address, u8)>,
    ndigits: u32,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<5} {:<44} {:<30} {:<44} {}",
        "n", "from_address", "balance", "to_address", "balance"
    );
    for line in instructions {
        let Ok(instruction) = &line.parsed else {
            continue;
        };
        let from = balance_cell(&instruction.from, rpc, routes, token, ndigits).await;
        let to = balance_cell(&instruction.to, rpc, routes, token, ndigits).await;
        let _ = writeln!(
            out,
            "{:<5} {:<44} {:<30} {:<44} {}",
            line.index, instruction.from, from, instruction.to, to
        );
    }
    out
}

async fn balance_cell(
    address: &str,
    rpc: &SolanaRpc,
    routes: &mut Routes,
    token: Option<(&Address, u8)>,
    ndigits: u32,
) -> String {
    let owner = match Address::parse(address) {
        Ok(address) => address.pubkey(),
        Err(e) => return e.kind().to_string(),
    };
    let route = routes.next_route();
    let sol = match rpc.sol_balance(&owner, &route).await {
        Ok(lamports) => human_cell(lamports, SOL_DECIMALS, Unit::Sol, ndigits),
        Err(e) => e.kind().to_string(),
    };
    let Some((mint, decimals)) = token else {
        return sol;
    };
    let tokens = match rpc.token_balance(&owner, &mint.pubkey(), &route).await {
        Ok(amount) => human_cell(amount, u32::from(decimals), Unit::Token, ndigits),
        Err(e) => e.kind().to_string(),
    };
    format!("{sol} / {tokens}")
}

fn human_cell(base_units: u64, decimals: u32, unit: Unit, ndigits: u32) -> String {
    match to_human(base_units, decimals) {
        Ok(amount) => format!("{}{unit}", amount.round_dp(ndigits).normalize()),
        Err(e) => e.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::expr::ValueExpr;
    use crate::types::{Confirmation, ResolvedTransfer, Stage, TransferRecord};
    use solana_sdk::signature::Signature;
    use std::time::Duration;

    const A: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const B: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";

    fn summary() -> BatchSummary {
        let transfer = ResolvedTransfer {
            from: Address::parse(A).unwrap(),
            to: Address::parse(B).unwrap(),
            amount: 1_234_567_890,
            unit: Unit::Sol,
            decimals: 9,
        };
        BatchSummary {
            records: vec![
                TransferRecord {
                    index: 1,
                    line: format!("{A} {B} 1.23456789"),
                    transfer: Some(transfer),
                    status: TransferStatus::Succeeded {
                        signature: Signature::default(),
                        confirmation: Confirmation::Confirmed,
                    },
                    duration_ms: 12,
                },
                TransferRecord {
                    index: 2,
                    line: format!("{A} {B} 1 - 5"),
                    transfer: None,
                    status: TransferStatus::Failed {
                        stage: Stage::Resolving,
                        error: TransferError::NegativeAmount((-4).into()),
                    },
                    duration_ms: 0,
                },
            ],
            elapsed: Duration::from_millis(20),
        }
    }

    #[test]
    fn summary_lists_every_record_and_reason() {
        let text = render_summary(&summary(), 4);
        assert!(text.contains("1.2346sol"));
        assert!(text.contains("NegativeAmountError"));
        assert!(text.contains("Successful: 1"));
        assert!(text.contains("Failed: 1"));
        assert!(text.contains(&Signature::default().to_string()));
    }

    #[test]
    fn balance_cells_never_panic_on_odd_decimals() {
        assert_eq!(human_cell(1_500_000_000, 9, Unit::Sol, 5), "1.5sol");
        assert_eq!(human_cell(1, 40, Unit::Token, 5), "RangeError");
    }

    #[test]
    fn transfers_show_effective_value() {
        let resolver = InstructionResolver::sol(Some(ValueExpr::parse("0.5balance").unwrap()), None);
        let lines = vec![
            InstructionLine::new(1, format!("{A} {B} 1")),
            InstructionLine::new(2, format!("{A} {B}")),
            InstructionLine::new(3, "oops"),
        ];
        let text = render_transfers(&lines, &resolver);
        let rows: Vec<_> = text.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[1].ends_with(" 1"));
        assert!(rows[2].ends_with("0.5balance"));
        assert!(rows[3].contains("parse error"));
    }
}
