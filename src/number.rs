//! Numeric tower.
//!
//! Every arithmetic operation converts both operands to an arbitrary-precision
//! rational, computes, and renormalizes through [`Cell::rational`]. Symbols
//! and strings whose text parses as a rational take part as numbers, which is
//! how unquoted numeric literals work.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::Error;
use crate::cell::Cell;

/// Parses integers (`-12`), fractions (`3/4`) and decimals (`1.25`).
pub fn parse_rational(text: &str) -> Option<BigRational> {
    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let value = if let Some((numer, denom)) = digits.split_once('/') {
        let numer = parse_digits(numer)?;
        let denom = parse_digits(denom)?;
        if denom.is_zero() {
            return None;
        }
        BigRational::new(numer, denom)
    } else if let Some((whole, fraction)) = digits.split_once('.') {
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let whole = if whole.is_empty() {
            BigInt::zero()
        } else {
            parse_digits(whole)?
        };
        let scale = BigInt::from(10).pow(u32::try_from(fraction.len()).ok()?);
        let fraction = if fraction.is_empty() {
            BigInt::zero()
        } else {
            parse_digits(fraction)?
        };
        BigRational::new(whole * &scale + fraction, scale)
    } else {
        BigRational::from_integer(parse_digits(digits)?)
    };
    Some(if negative { -value } else { value })
}

fn parse_digits(text: &str) -> Option<BigInt> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

pub fn is_numeric(text: &str) -> bool {
    parse_rational(text).is_some()
}

/// Rational value of an atom, if it has one.
pub fn to_rational(cell: &Cell) -> Option<BigRational> {
    match cell {
        Cell::Boolean(b) => Some(BigRational::from_integer(BigInt::from(u8::from(*b)))),
        Cell::Integer(n) => Some(BigRational::from_integer(BigInt::from(**n))),
        Cell::Float(f) => BigRational::from_float(**f),
        Cell::Rational(r) => Some((**r).clone()),
        Cell::Status(n) => Some(BigRational::from_integer(BigInt::from(**n))),
        Cell::Symbol(s) | Cell::String(s) => parse_rational(s),
        _ => None,
    }
}

pub fn expect_rational(cell: &Cell) -> Result<BigRational, Error> {
    to_rational(cell).ok_or_else(|| Error::type_error(format!("expected number, got {cell}")))
}

/// Exact integer value, rejecting non-integral rationals.
pub fn expect_integer(cell: &Cell) -> Result<BigInt, Error> {
    let r = expect_rational(cell)?;
    if r.is_integer() {
        Ok(r.to_integer())
    } else {
        Err(Error::type_error(format!("expected integer, got {cell}")))
    }
}

pub fn expect_i64(cell: &Cell) -> Result<i64, Error> {
    expect_integer(cell)?
        .to_i64()
        .ok_or_else(|| Error::runtime(format!("{cell} is out of range")))
}

pub fn add(a: &Cell, b: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(expect_rational(a)? + expect_rational(b)?))
}

pub fn subtract(a: &Cell, b: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(expect_rational(a)? - expect_rational(b)?))
}

pub fn multiply(a: &Cell, b: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(expect_rational(a)? * expect_rational(b)?))
}

pub fn divide(a: &Cell, b: &Cell) -> Result<Cell, Error> {
    let divisor = expect_rational(b)?;
    if divisor.is_zero() {
        return Err(Error::DivideByZero);
    }
    Ok(Cell::rational(expect_rational(a)? / divisor))
}

/// Remainder with the sign of the dividend. Both operands must be exact
/// integers.
pub fn modulo(a: &Cell, b: &Cell) -> Result<Cell, Error> {
    let divisor = expect_integer(b)?;
    if divisor.is_zero() {
        return Err(Error::DivideByZero);
    }
    let remainder = expect_integer(a)? % divisor;
    Ok(Cell::rational(BigRational::from_integer(remainder)))
}

pub fn negate(a: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(-expect_rational(a)?))
}

pub fn reciprocal(a: &Cell) -> Result<Cell, Error> {
    divide(&Cell::rational(BigRational::one()), a)
}

/// Ordering of two atoms.
///
/// Symbols order numerically only when both sides are numeric and fall back
/// to lexical order otherwise; strings always order lexically.
pub fn compare(a: &Cell, b: &Cell) -> Result<Ordering, Error> {
    match a {
        Cell::String(text) => Ok(text.as_ref().cmp(b.raw().as_str())),
        Cell::Symbol(text) => match (parse_rational(text), to_rational(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => Ok(text.as_ref().cmp(b.raw().as_str())),
        },
        _ => Ok(expect_rational(a)?.cmp(&expect_rational(b)?)),
    }
}

/// Truncates a rational toward zero.
pub fn truncate(a: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(expect_rational(a)?.trunc()))
}

pub fn to_float(a: &Cell) -> Result<f64, Error> {
    match a {
        Cell::Float(f) => Ok(**f),
        other => {
            let r = expect_rational(other)?;
            let value = r.numer().to_f64().zip(r.denom().to_f64()).map(|(n, d)| n / d);
            value.ok_or_else(|| Error::runtime(format!("{other} is out of range")))
        }
    }
}

pub fn abs(a: &Cell) -> Result<Cell, Error> {
    Ok(Cell::rational(expect_rational(a)?.abs()))
}
