//! Payout address validation (EVM / EIP-55).
//!
//! Addresses are `0x` followed by 40 hex digits. All-lowercase and
//! all-uppercase forms carry no checksum and are accepted; mixed-case input
//! must match its EIP-55 checksum exactly. Accepted addresses are always
//! stored in checksummed form.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address must start with 0x")]
    MissingPrefix,

    #[error("Address must have 40 hex digits, got {0}")]
    WrongLength(usize),

    #[error("Address contains non-hex characters")]
    NotHex,

    #[error("Address checksum mismatch (expected {expected})")]
    BadChecksum { expected: String },
}

/// A validated, checksummed EVM address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        let digits = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .ok_or(AddressError::MissingPrefix)?;

        if digits.len() != 40 {
            return Err(AddressError::WrongLength(digits.len()));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex);
        }

        let checksummed = to_checksum(digits);
        let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper && checksummed[2..] != *digits {
            return Err(AddressError::BadChecksum {
                expected: checksummed,
            });
        }

        Ok(Self(checksummed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// EIP-55: uppercase each letter whose nibble in keccak256(lowercase hex) is >= 8.
fn to_checksum(digits: &str) -> String {
    let lower = digits.to_ascii_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, ch) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

impl FromStr for WalletAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WalletAddress::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        WalletAddress::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
