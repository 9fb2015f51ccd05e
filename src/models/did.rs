// src/models/did.rs
//! Decentralized Identifier (DID) data model.
//!
//! Identities in the gateway are `did:ethr` identifiers derived deterministically
//! from an on-chain address:
//! ```text
//! did:ethr:0x<40 lowercase hex chars>
//! ```

use crate::error::CryptoError;
use crate::utils::crypto::{format_address, parse_address};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// DID method prefix used for every wallet-derived identifier.
pub const DID_PREFIX: &str = "did:ethr:";

/// A wallet-derived decentralized identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Did {
    address: Address,
}

impl Did {
    /// Derives the DID for an address.
    pub fn from_address(address: Address) -> Self {
        Did { address }
    }

    /// The on-chain address this DID was derived from.
    pub fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DID_PREFIX, format_address(self.address))
    }
}

impl FromStr for Did {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(DID_PREFIX)
            .ok_or_else(|| CryptoError::InvalidAddress(s.to_string()))?;
        // Tolerate a network segment such as `did:ethr:sepolia:0x..`.
        let address = rest.rsplit(':').next().unwrap_or(rest);
        Ok(Did::from_address(parse_address(address)?))
    }
}

impl TryFrom<String> for Did {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_round_trip() {
        let address = Address::repeat_byte(0xab);
        let did = Did::from_address(address);
        let text = did.to_string();
        assert_eq!(text, format!("did:ethr:0x{}", "ab".repeat(20)));
        assert_eq!(text.parse::<Did>().unwrap().address(), address);
    }

    #[test]
    fn test_did_with_network_segment() {
        let text = format!("did:ethr:sepolia:0x{}", "01".repeat(20));
        assert_eq!(text.parse::<Did>().unwrap().address(), Address::repeat_byte(0x01));
    }

    #[test]
    fn test_rejects_other_methods() {
        assert!("did:key:z6Mk".parse::<Did>().is_err());
        assert!("did:ethr:0x12".parse::<Did>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let did = Did::from_address(Address::repeat_byte(0x11));
        let json = serde_json::to_string(&did).unwrap();
        assert_eq!(json, format!("\"{}\"", did));
        let back: Did = serde_json::from_str(&json).unwrap();
        assert_eq!(back, did);
    }
}
