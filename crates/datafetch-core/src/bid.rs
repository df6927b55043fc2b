//! Bundle identifiers.
//!
//! A `Bid` is an opaque, time-ordered identifier minted when a bundle is
//! discovered. The string carries a 13-digit zero-padded millisecond
//! timestamp followed by 80 bits of randomness, grouped `8-4-4-4-12` so the
//! lexicographic order of bids approximates their creation order.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

const GROUP_LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];

/// Time-ordered bundle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bid(String);

impl Bid {
    /// Mint a fresh identifier stamped with the current wall-clock time.
    pub fn mint() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let mut random = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut random);

        Self::from_parts(millis, &random)
    }

    fn from_parts(timestamp_millis: u128, random: &[u8; 10]) -> Self {
        let ts = format!("{timestamp_millis:013}");
        let rand_hex = hex::encode(random);
        Bid(format!(
            "{}-{}-{}-{}-{}",
            &ts[..8],
            &ts[8..12],
            &rand_hex[..4],
            &rand_hex[4..8],
            &rand_hex[8..20],
        ))
    }

    /// Parse and validate an identifier previously produced by [`Bid::mint`].
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() != GROUP_LENGTHS.len() {
            return Err(FetchError::validation("bid", "invalid bid format"));
        }
        for (part, expected_len) in parts.iter().zip(GROUP_LENGTHS) {
            if part.len() != expected_len || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(FetchError::validation("bid", "invalid bid format"));
            }
        }
        Ok(Bid(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Bid {
    type Error = FetchError;

    fn try_from(value: String) -> Result<Self> {
        Bid::parse(&value)
    }
}

impl From<Bid> for String {
    fn from(bid: Bid) -> String {
        bid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_valid_bid() {
        let bid = Bid::mint();
        let reparsed = Bid::parse(bid.as_str()).unwrap();
        assert_eq!(bid, reparsed);
    }

    #[test]
    fn mint_is_time_ordered() {
        let earlier = Bid::from_parts(1_700_000_000_000, &[0u8; 10]);
        let later = Bid::from_parts(1_700_000_000_001, &[0u8; 10]);
        assert!(earlier.as_str() < later.as_str());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Bid::parse("").is_err());
        assert!(Bid::parse("not-a-bid").is_err());
        assert!(Bid::parse("17000000-0000-zzzz-0000-000000000000").is_err());
        assert!(Bid::parse("17000000-0000-0000-0000").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let bid = Bid::mint();
        let json = serde_json::to_string(&bid).unwrap();
        let back: Bid = serde_json::from_str(&json).unwrap();
        assert_eq!(bid, back);

        let invalid = serde_json::from_str::<Bid>("\"nope\"");
        assert!(invalid.is_err());
    }
}
