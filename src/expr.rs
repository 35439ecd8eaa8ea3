//! Value expressions.
//!
//! A value expression computes a transfer amount (or a delay) from numeric
//! literals, the sender's `balance` and `random(low, high)` draws:
//!
//! ```text
//! expr    := [+|-] term (('+' | '-') term)*
//! term    := number [unit] | [number] 'balance' | 'random' '(' number [unit] ',' number [unit] ')'
//! unit    := 'sol' | 't'
//! ```
//!
//! Expressions are parsed once into an [`Expr`] tree and evaluated on every
//! dispatch. `random` redraws on each evaluation.

use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ExprError;

const BALANCE: &str = "balance";
const RANDOM: &str = "random";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Sol,
    Token,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Sol => f.write_str("sol"),
            Unit::Token => f.write_str("t"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinOp::Add => f.write_str("+"),
            BinOp::Sub => f.write_str("-"),
        }
    }
}

/// A literal with its optional unit suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    pub value: Decimal,
    pub unit: Option<Unit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(Literal),
    /// `balance`, optionally scaled: `0.6balance`.
    BalanceRef { coefficient: Decimal },
    RandomCall { low: Literal, high: Literal },
    BinaryOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn references_balance(&self) -> bool {
        match self {
            Expr::BalanceRef { .. } => true,
            Expr::Literal(_) | Expr::RandomCall { .. } => false,
            Expr::BinaryOp { lhs, rhs, .. } => lhs.references_balance() || rhs.references_balance(),
        }
    }

    /// Inclusive range of values the expression can take, `None` when it
    /// depends on `balance` or a bound overflows.
    fn bounds(&self) -> Option<(Decimal, Decimal)> {
        match self {
            Expr::Literal(literal) => Some((literal.value, literal.value)),
            Expr::BalanceRef { .. } => None,
            Expr::RandomCall { low, high } => Some((low.value, high.value)),
            Expr::BinaryOp { op, lhs, rhs } => {
                let (a_low, a_high) = lhs.bounds()?;
                let (b_low, b_high) = rhs.bounds()?;
                match op {
                    BinOp::Add => Some((a_low.checked_add(b_low)?, a_high.checked_add(b_high)?)),
                    BinOp::Sub => Some((a_low.checked_sub(b_high)?, a_high.checked_sub(b_low)?)),
                }
            }
        }
    }

    fn eval<R: Rng + ?Sized>(&self, balance: Option<Decimal>, rng: &mut R) -> Result<Decimal, ExprError> {
        match self {
            Expr::Literal(literal) => Ok(literal.value),
            Expr::BalanceRef { coefficient } => {
                let balance = balance.ok_or_else(|| ExprError::UnknownVariable(BALANCE.to_string()))?;
                coefficient
                    .checked_mul(balance)
                    .ok_or_else(|| ExprError::Overflow(format!("{coefficient} * {balance}")))
            }
            Expr::RandomCall { low, high } => Ok(random_decimal(low.value, high.value, rng)),
            Expr::BinaryOp { op, lhs, rhs } => {
                let lhs = lhs.eval(balance, rng)?;
                let rhs = rhs.eval(balance, rng)?;
                let result = match op {
                    BinOp::Add => lhs.checked_add(rhs),
                    BinOp::Sub => lhs.checked_sub(rhs),
                };
                result.ok_or_else(|| ExprError::Overflow(format!("{lhs} {op} {rhs}")))
            }
        }
    }
}

/// Uniform draw from `[low, high]` at the finer of the two literal precisions.
fn random_decimal<R: Rng + ?Sized>(low: Decimal, high: Decimal, rng: &mut R) -> Decimal {
    let scale = low.scale().max(high.scale());
    let (mut low, mut high) = (low, high);
    low.rescale(scale);
    high.rescale(scale);
    let mantissa = rng.gen_range(low.mantissa()..=high.mantissa());
    Decimal::from_i128_with_scale(mantissa, scale)
}

/// A parsed value expression together with its source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueExpr {
    source: String,
    root: Expr,
    unit: Option<Unit>,
}

impl ValueExpr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let normalized = source.trim().to_ascii_lowercase();
        let mut parser = Parser::new(&normalized);
        let root = parser.expr()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
            unit: parser.unit,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Unit of the suffixed literals, if any literal carries one.
    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn references_balance(&self) -> bool {
        self.root.references_balance()
    }

    /// Smallest and largest value a balance-free expression can evaluate to.
    pub fn bounds(&self) -> Option<(Decimal, Decimal)> {
        self.root.bounds()
    }

    /// Bare numbers take the expected unit; suffixes must agree with it.
    pub fn ensure_unit(&self, expected: Unit) -> Result<(), ExprError> {
        match self.unit {
            Some(found) if found != expected => Err(ExprError::UnitMismatch { expected, found }),
            _ => Ok(()),
        }
    }

    /// Evaluates left to right. `balance` must be supplied when referenced.
    pub fn evaluate<R: Rng + ?Sized>(&self, balance: Option<Decimal>, rng: &mut R) -> Result<Decimal, ExprError> {
        self.root.eval(balance, rng)
    }
}

impl FromStr for ValueExpr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    unit: Option<Unit>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            unit: None,
        }
    }

    fn error(&self, message: &str) -> ExprError {
        ExprError::Parse {
            position: self.pos + 1,
            message: message.to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while self.src.get(self.pos).is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ExprError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", byte as char)))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(keyword.as_bytes()) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                let term = self.term()?;
                Expr::BinaryOp {
                    op: BinOp::Sub,
                    lhs: Box::new(Expr::Literal(Literal {
                        value: Decimal::ZERO,
                        unit: None,
                    })),
                    rhs: Box::new(term),
                }
            }
            Some(b'+') => {
                self.pos += 1;
                self.term()?
            }
            _ => self.term()?,
        };

        loop {
            let op = match self.peek() {
                Some(b'+') => BinOp::Add,
                Some(b'-') => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        if self.eat_keyword(RANDOM) {
            self.expect(b'(')?;
            let low = self.literal()?;
            self.expect(b',')?;
            let high = self.literal()?;
            self.expect(b')')?;
            if low.value > high.value {
                return Err(ExprError::Range {
                    low: low.value,
                    high: high.value,
                });
            }
            return Ok(Expr::RandomCall { low, high });
        }
        if self.eat_keyword(BALANCE) {
            return Ok(Expr::BalanceRef {
                coefficient: Decimal::ONE,
            });
        }

        let value = self.number()?;
        if self.eat_keyword(BALANCE) {
            return Ok(Expr::BalanceRef { coefficient: value });
        }
        let unit = self.unit_suffix()?;
        Ok(Expr::Literal(Literal { value, unit }))
    }

    fn literal(&mut self) -> Result<Literal, ExprError> {
        let value = self.number()?;
        let unit = self.unit_suffix()?;
        Ok(Literal { value, unit })
    }

    fn number(&mut self) -> Result<Decimal, ExprError> {
        self.skip_ws();
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a number, `balance` or `random(..)`"));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.error("invalid number"))?;
        Decimal::from_str(text).map_err(|_| ExprError::Parse {
            position: start + 1,
            message: format!("invalid number `{text}`"),
        })
    }

    fn unit_suffix(&mut self) -> Result<Option<Unit>, ExprError> {
        let unit = if self.eat_keyword("sol") {
            Unit::Sol
        } else if self.eat_keyword("t") {
            Unit::Token
        } else {
            return Ok(None);
        };
        match self.unit {
            Some(seen) if seen != unit => Err(ExprError::UnitMismatch {
                expected: seen,
                found: unit,
            }),
            _ => {
                self.unit = Some(unit);
                Ok(Some(unit))
            }
        }
    }
}
