//! Device identifier validation.
//!
//! Normalizes raw caller input and checks length and the Luhn check digit
//! before any network cost is spent on the portal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::FailureKind;

/// Shortest identifier accepted (IMEI without check digit is still Luhn-checked).
pub const MIN_IDENTIFIER_LEN: usize = 14;
/// Longest identifier accepted (IMEISV length).
pub const MAX_IDENTIFIER_LEN: usize = 16;

const SEPARATORS: &[char] = &['-', '.', '/', '_'];

/// A normalized, checksum-valid device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Normalize and validate raw input.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        validate(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of digits in the normalized identifier.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// Reasons an identifier is rejected. Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("identifier must be 14-16 digits, got {length} characters")]
    InvalidLength { length: usize },
    #[error("identifier check digit does not validate")]
    InvalidChecksum,
}

impl ValidationError {
    pub fn is_retryable(&self) -> bool {
        false
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ValidationError::InvalidLength { .. } => FailureKind::InvalidLength,
            ValidationError::InvalidChecksum => FailureKind::InvalidChecksum,
        }
    }
}

/// Strip surrounding whitespace and the separators people paste IMEIs with.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !SEPARATORS.contains(c))
        .collect()
}

/// Validate raw input and return the normalized identifier.
pub fn validate(raw: &str) -> Result<Identifier, ValidationError> {
    let normalized = normalize(raw);

    let length = normalized.chars().count();
    if !(MIN_IDENTIFIER_LEN..=MAX_IDENTIFIER_LEN).contains(&length)
        || !normalized.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ValidationError::InvalidLength { length });
    }

    if !luhn_valid(&normalized) {
        return Err(ValidationError::InvalidChecksum);
    }

    Ok(Identifier(normalized))
}

/// Luhn mod-10 over an all-digit string, last digit being the check digit.
pub fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (index, byte) in digits.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let mut value = u32::from(byte - b'0');
        if index % 2 == 1 {
            value *= 2;
            if value > 9 {
                value -= 9;
            }
        }
        sum += value;
    }
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "359871977331199";

    #[test]
    fn accepts_known_valid_imei() {
        let id = validate(VALID).expect("valid imei");
        assert_eq!(id.as_str(), VALID);
        assert_eq!(id.len(), 15);
    }

    #[test]
    fn normalizes_separators_and_whitespace() {
        let id = validate("  35-987197 7331199 ").expect("valid after normalization");
        assert_eq!(id.as_str(), VALID);
        assert_eq!(validate("35.9871.9773.3119/9").unwrap(), id);
    }

    #[test]
    fn rejects_lengths_outside_range() {
        for len in [0usize, 1, 8, 13, 17, 20, 32] {
            let raw = "1".repeat(len);
            assert_eq!(
                validate(&raw),
                Err(ValidationError::InvalidLength { length: len }),
                "length {len}"
            );
        }
        assert!(matches!(
            validate("not-an-imei"),
            Err(ValidationError::InvalidLength { .. })
        ));
    }

    #[test]
    fn rejects_letters_inside_valid_length() {
        assert_eq!(
            validate("35987197733119A"),
            Err(ValidationError::InvalidLength { length: 15 })
        );
        assert_eq!(
            validate("ABCDEFGHIJKLMNO"),
            Err(ValidationError::InvalidLength { length: 15 })
        );
        assert_eq!(
            validate("ABCDEFGHIJKLMNO").unwrap_err().failure_kind(),
            FailureKind::InvalidLength
        );
    }

    #[test]
    fn accepts_generated_check_digits() {
        for body in ["35987197733119", "49015420323751", "86753090000000"] {
            let check = (0..=9)
                .map(|d| format!("{body}{d}"))
                .find(|candidate| luhn_valid(candidate))
                .expect("one digit always completes luhn");
            assert!(validate(&check).is_ok(), "{check}");
        }
    }

    #[test]
    fn single_digit_flip_breaks_checksum() {
        let digits: Vec<u8> = VALID.bytes().collect();
        let mut detected_positions = 0;
        for position in 0..digits.len() {
            let mut flipped = digits.clone();
            flipped[position] = if flipped[position] == b'9' {
                b'0'
            } else {
                flipped[position] + 1
            };
            let candidate = String::from_utf8(flipped).unwrap();
            if validate(&candidate) == Err(ValidationError::InvalidChecksum) {
                detected_positions += 1;
            }
        }
        assert_eq!(detected_positions, digits.len());
    }

    #[test]
    fn serde_round_trips_through_string() {
        let id = validate(VALID).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{VALID}\""));
        let bad: Result<Identifier, _> = serde_json::from_str("\"359871977331190\"");
        assert!(bad.is_err());
    }
}
