//! Pricing formula language
//!
//! Formulas are small arithmetic expressions over decimals:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := power (('*' | '/') power)*
//! power   := unary ('^' power)?
//! unary   := '-' unary | primary
//! primary := (number | variable | 'ceil' '(' expr ')' | '(' expr ')') ('::' type)?
//! ```
//!
//! Variables are `$time_in_seconds`, `$memory_in_mb`, `$storage_in_mb` and
//! `$number_of_nodes`. A formula is parsed once when the configuration is
//! installed and evaluated many times during pricing.

use billing_core::{AppError, AppResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use std::fmt;
use thiserror::Error;

/// Failure while evaluating a parsed formula
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("exponent must be a non-negative integer, got {0}")]
    InvalidExponent(Decimal),
}

/// Usage variable available to formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    TimeInSeconds,
    MemoryInMb,
    StorageInMb,
    NumberOfNodes,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "time_in_seconds" => Some(Variable::TimeInSeconds),
            "memory_in_mb" => Some(Variable::MemoryInMb),
            "storage_in_mb" => Some(Variable::StorageInMb),
            "number_of_nodes" => Some(Variable::NumberOfNodes),
            _ => None,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variable::TimeInSeconds => "$time_in_seconds",
            Variable::MemoryInMb => "$memory_in_mb",
            Variable::StorageInMb => "$storage_in_mb",
            Variable::NumberOfNodes => "$number_of_nodes",
        };
        f.write_str(name)
    }
}

/// Values bound to the formula variables for one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bindings {
    pub time_in_seconds: Decimal,
    pub memory_in_mb: Decimal,
    pub storage_in_mb: Decimal,
    pub number_of_nodes: Decimal,
}

impl Bindings {
    fn get(&self, variable: Variable) -> Decimal {
        match variable {
            Variable::TimeInSeconds => self.time_in_seconds,
            Variable::MemoryInMb => self.memory_in_mb,
            Variable::StorageInMb => self.storage_in_mb,
            Variable::NumberOfNodes => self.number_of_nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cast {
    Integer,
    Numeric,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Number(Decimal),
    Variable(Variable),
    Neg(Box<Expr>),
    Ceil(Box<Expr>),
    Cast(Box<Expr>, Cast),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(Decimal),
    Variable(Variable),
    Ceil,
    Cast(Cast),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Variable(v) => write!(f, "{}", v),
            Token::Ceil => f.write_str("ceil"),
            Token::Cast(Cast::Integer) => f.write_str("::integer"),
            Token::Cast(Cast::Numeric) => f.write_str("::numeric"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Caret => f.write_str("^"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

fn illegal(token: &str) -> AppError {
    AppError::Formula(format!("illegal token in formula: {}", token))
}

fn tokenize(source: &str) -> AppResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let take_word = |start: usize| -> usize {
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        end
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<Decimal>()
                    .map_err(|_| illegal(&literal))?;
                tokens.push(Token::Number(value));
            }
            '$' => {
                let end = take_word(i + 1);
                let name: String = chars[i + 1..end].iter().collect();
                let variable =
                    Variable::from_name(&name).ok_or_else(|| illegal(&format!("${}", name)))?;
                tokens.push(Token::Variable(variable));
                i = end;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                let end = take_word(i + 2);
                let name: String = chars[i + 2..end].iter().collect();
                let cast = match name.as_str() {
                    "integer" | "bigint" => Cast::Integer,
                    "numeric" | "decimal" => Cast::Numeric,
                    _ => return Err(illegal(&format!("::{}", name))),
                };
                tokens.push(Token::Cast(cast));
                i = end;
            }
            c if c.is_ascii_alphabetic() => {
                let end = take_word(i);
                let word: String = chars[i..end].iter().collect();
                if word == "ceil" {
                    tokens.push(Token::Ceil);
                } else {
                    return Err(illegal(&word));
                }
                i = end;
            }
            other => return Err(illegal(&other.to_string())),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> AppResult<()> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(AppError::Formula(format!(
                "expected ')' but found '{}'",
                other
            ))),
            None => Err(AppError::Formula("unbalanced parentheses".to_string())),
        }
    }

    fn expr(&mut self) -> AppResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> AppResult<Expr> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn power(&mut self) -> AppResult<Expr> {
        let base = self.unary()?;
        if self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            let exponent = self.power()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> AppResult<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> AppResult<Expr> {
        let expr = match self.next() {
            Some(Token::Number(n)) => Expr::Number(n),
            Some(Token::Variable(v)) => Expr::Variable(v),
            Some(Token::Ceil) => {
                match self.next() {
                    Some(Token::LParen) => {}
                    _ => return Err(AppError::Formula("expected '(' after ceil".to_string())),
                }
                let inner = self.expr()?;
                self.expect_rparen()?;
                Expr::Ceil(Box::new(inner))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect_rparen()?;
                inner
            }
            Some(other) => {
                return Err(AppError::Formula(format!("unexpected token '{}'", other)))
            }
            None => return Err(AppError::Formula("unexpected end of formula".to_string())),
        };

        let mut expr = expr;
        while let Some(Token::Cast(cast)) = self.peek() {
            let cast = *cast;
            self.pos += 1;
            expr = Expr::Cast(Box::new(expr), cast);
        }
        Ok(expr)
    }
}

/// A parsed pricing formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula, rejecting unknown tokens and unbalanced parentheses
    pub fn parse(source: &str) -> AppResult<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(AppError::Formula("formula is empty".to_string()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        match parser.next() {
            None => Ok(Self {
                source: source.to_string(),
                expr,
            }),
            Some(Token::RParen) => Err(AppError::Formula("unbalanced parentheses".to_string())),
            Some(other) => Err(AppError::Formula(format!("unexpected token '{}'", other))),
        }
    }

    /// Original formula text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a set of variable bindings
    pub fn eval(&self, bindings: &Bindings) -> Result<Decimal, EvalError> {
        eval(&self.expr, bindings)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, bindings: &Bindings) -> Result<Decimal, EvalError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(v) => Ok(bindings.get(*v)),
        Expr::Neg(inner) => Ok(-eval(inner, bindings)?),
        Expr::Ceil(inner) => Ok(eval(inner, bindings)?.ceil()),
        Expr::Cast(inner, Cast::Integer) => Ok(eval(inner, bindings)?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)),
        Expr::Cast(inner, Cast::Numeric) => eval(inner, bindings),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            match op {
                BinaryOp::Add => lhs.checked_add(rhs).ok_or(EvalError::Overflow),
                BinaryOp::Sub => lhs.checked_sub(rhs).ok_or(EvalError::Overflow),
                BinaryOp::Mul => lhs.checked_mul(rhs).ok_or(EvalError::Overflow),
                BinaryOp::Div => {
                    if rhs.is_zero() {
                        return Err(EvalError::DivisionByZero);
                    }
                    lhs.checked_div(rhs).ok_or(EvalError::Overflow)
                }
                BinaryOp::Pow => {
                    if rhs.is_sign_negative() || !rhs.fract().is_zero() {
                        return Err(EvalError::InvalidExponent(rhs));
                    }
                    let exponent = rhs.to_i64().ok_or(EvalError::Overflow)?;
                    lhs.checked_powi(exponent).ok_or(EvalError::Overflow)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bindings() -> Bindings {
        Bindings {
            time_in_seconds: dec!(60),
            memory_in_mb: dec!(64),
            storage_in_mb: dec!(128),
            number_of_nodes: dec!(2),
        }
    }

    fn eval_str(source: &str) -> Decimal {
        Formula::parse(source).unwrap().eval(&bindings()).unwrap()
    }

    #[test]
    fn test_basic_arithmetic() {
        assert_eq!(eval_str("((2 * 2::integer) + 1 - 1) / 1"), dec!(4));
        assert_eq!(eval_str("12147483647 * (2)::bigint"), dec!(24294967294));
        assert_eq!(eval_str("1.5 * 2"), dec!(3.0));
        assert_eq!(eval_str("1 + 2 * 3"), dec!(7));
        assert_eq!(eval_str("10 - 4 - 3"), dec!(3));
        assert_eq!(eval_str("-2 * 3"), dec!(-6));
    }

    #[test]
    fn test_variables() {
        assert_eq!(eval_str("$time_in_seconds * 2"), dec!(120));
        assert_eq!(eval_str("$memory_in_mb * 2"), dec!(128));
        assert_eq!(eval_str("$storage_in_mb * 2"), dec!(256));
        assert_eq!(eval_str("$number_of_nodes * 2"), dec!(4));
    }

    #[test]
    fn test_division_is_not_truncated() {
        let result = eval_str("$time_in_seconds / 3600 * 2");
        assert_eq!(result.round_dp(10), dec!(0.0333333333));
        assert_eq!(eval_str("$memory_in_mb / 1024 * 2"), dec!(0.125));
    }

    #[test]
    fn test_power_and_ceil() {
        assert_eq!(eval_str("2^2"), dec!(4));
        assert_eq!(eval_str("2^3^2"), dec!(512));
        assert_eq!(eval_str("ceil(5.0/3.0)"), dec!(2));
        assert_eq!(eval_str("ceil($time_in_seconds / 3600) * 10"), dec!(10));
    }

    #[test]
    fn test_illegal_tokens() {
        let message = |source: &str| Formula::parse(source).unwrap_err().to_string();
        assert!(message("1+1;").contains("illegal token in formula: ;"));
        assert!(message("select").contains("illegal token in formula: select"));
        assert!(message("$unknown").contains("illegal token in formula: $unknown"));
    }

    #[test]
    fn test_malformed_formulas() {
        assert!(Formula::parse("ceil(5").is_err());
        assert!(Formula::parse("(1 + 2").is_err());
        assert!(Formula::parse("1 + 2)").is_err());
        assert!(Formula::parse("1 +").is_err());
        assert!(Formula::parse("").is_err());
        assert!(Formula::parse("1 2").is_err());
    }

    #[test]
    fn test_eval_errors() {
        let formula = Formula::parse("1 / ($number_of_nodes - 2)").unwrap();
        assert_eq!(formula.eval(&bindings()), Err(EvalError::DivisionByZero));

        let formula = Formula::parse("2 ^ 0.5").unwrap();
        assert!(matches!(formula.eval(&bindings()), Err(EvalError::InvalidExponent(_))));
    }

    #[test]
    fn test_source_is_kept() {
        let formula = Formula::parse("ceil($time_in_seconds/3600) * 0.01").unwrap();
        assert_eq!(formula.source(), "ceil($time_in_seconds/3600) * 0.01");
    }
}
