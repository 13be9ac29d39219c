use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};
use sqlx::Type;
use thiserror::Error;

use crate::op;

pub const BITCOIN_CURRENCY_CODE: &str = "BTC";
pub const SATS_PER_BTC: i64 = 100_000_000;

//--------------------------------------        Sats         ---------------------------------------------------------
/// An amount of bitcoin, in satoshis. Amounts are always whole satoshis; there is no floating point representation.
#[derive(Debug, Clone, Copy, Default, Type, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Sats(i64);

op!(binary Sats, Add, add);
op!(binary Sats, Sub, sub);
op!(inplace Sats, AddAssign, add_assign);
op!(inplace Sats, SubAssign, sub_assign);
op!(unary Sats, Neg, neg);

impl Sum for Sats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Value cannot be represented in sats: {0}")]
pub struct SatsConversionError(String);

impl From<i64> for Sats {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl TryFrom<u64> for Sats {
    type Error = SatsConversionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value > i64::MAX as u64 {
            Err(SatsConversionError(format!("Value {value} is too large to convert to Sats")))
        } else {
            #[allow(clippy::cast_possible_wrap)]
            Ok(Self(value as i64))
        }
    }
}

impl Display for Sats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sats", self.0)
    }
}

impl Sats {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Invoice amounts are whole satoshis and strictly positive. Anything else is rejected.
    pub fn positive(value: i64) -> Result<Self, SatsConversionError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(SatsConversionError(format!("{value} is not a positive amount")))
        }
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }
}
