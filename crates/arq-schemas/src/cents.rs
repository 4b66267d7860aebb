//! Fixed-point euro amounts.
//!
//! Every monetary value in the workspace is an integer number of cents.
//! Conversion from decimal text is digit-exact — no binary floating point is
//! involved at any stage, so repeated runs over the same payload always
//! produce the same sums.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};

/// An exact euro amount in cents.
///
/// Serializes as a decimal string with two fraction digits (`"5000.00"`) so
/// downstream consumers never see a binary float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cents(pub i64);

/// Errors produced when parsing a decimal amount into cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentsParseError {
    /// The string was empty or whitespace.
    Empty,
    /// The string is not a plain decimal number.
    Invalid(String),
    /// More than two fraction digits (would require rounding).
    TooManyDecimalPlaces(String),
    /// The value does not fit in an `i64` cent count.
    Overflow(String),
}

impl fmt::Display for CentsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentsParseError::Empty => write!(f, "amount is empty"),
            CentsParseError::Invalid(raw) => {
                write!(f, "amount could not be parsed: '{raw}'")
            }
            CentsParseError::TooManyDecimalPlaces(raw) => {
                write!(f, "amount has more than 2 decimal places: '{raw}'")
            }
            CentsParseError::Overflow(raw) => write!(f, "amount out of range: '{raw}'"),
        }
    }
}

impl std::error::Error for CentsParseError {}

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Parse a decimal string into cents deterministically.
    ///
    /// Rules:
    /// - Accepts an optional leading `+` or `-`.
    /// - Accepts `.` or `,` as the decimal separator (SICAL payloads use the
    ///   Spanish comma convention).
    /// - Rejects more than 2 fraction digits, empty strings, and anything
    ///   that is not pure digits around a single separator.
    pub fn parse(s: &str) -> Result<Cents, CentsParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CentsParseError::Empty);
        }

        let (negative, digits) = if let Some(rest) = s.strip_prefix('-') {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix('+') {
            (false, rest)
        } else {
            (false, s)
        };

        if digits.is_empty() {
            return Err(CentsParseError::Invalid(s.to_string()));
        }

        // Normalize the Spanish comma separator before splitting.
        let normalized = digits.replace(',', ".");
        let (int_part, frac_part) = match normalized.split_once('.') {
            Some((i, f)) => (i.to_string(), f.to_string()),
            None => (normalized, String::new()),
        };

        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(CentsParseError::Invalid(s.to_string()));
        }
        if !all_digits(&int_part) || !all_digits(&frac_part) {
            return Err(CentsParseError::Invalid(s.to_string()));
        }
        if frac_part.len() > 2 {
            return Err(CentsParseError::TooManyDecimalPlaces(s.to_string()));
        }

        let int_val: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse::<i64>()
                .map_err(|_| CentsParseError::Overflow(s.to_string()))?
        };

        let mut frac_padded = frac_part.clone();
        while frac_padded.len() < 2 {
            frac_padded.push('0');
        }
        let frac_val: i64 = if frac_padded.is_empty() {
            0
        } else {
            frac_padded
                .parse::<i64>()
                .map_err(|_| CentsParseError::Invalid(s.to_string()))?
        };

        let cents = int_val
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac_val))
            .ok_or_else(|| CentsParseError::Overflow(s.to_string()))?;

        Ok(Cents(if negative { -cents } else { cents }))
    }

    /// Absolute difference between two amounts.
    pub fn abs_delta(self, other: Cents) -> Cents {
        Cents((self.0 - other.0).abs())
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether the amount is strictly positive.
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Decimal rendering with the SICAL comma separator (`"5000,00"`), used
    /// when keying amounts into the ledger application.
    pub fn to_ledger_string(self) -> String {
        self.to_string().replace('.', ",")
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Cents {
    type Output = Cents;
    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        self.0 += rhs.0;
    }
}

impl Sub for Cents {
    type Output = Cents;
    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0 - rhs.0)
    }
}

impl Neg for Cents {
    type Output = Cents;
    fn neg(self) -> Cents {
        Cents(-self.0)
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, Add::add)
    }
}

impl Serialize for Cents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Cents, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cents::parse(&s).map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
