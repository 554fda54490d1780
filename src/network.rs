//! Network parameters for supported chains
//!
//! This module provides immutable network configuration passed into
//! constructors: bech32 prefix for segwit classification, base58 prefixes,
//! the SLIP-44 coin type used in derivation paths, and the underlying
//! `bitcoin::Network` used for address encoding.

use bitcoin::Network;

/// Network parameters for address encoding and HD derivation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkParams {
    /// Bech32 prefix (e.g., "bc" for mainnet, "tb" for testnet)
    pub bech32_prefix: String,
    /// P2PKH address prefix (e.g., 0x00 for mainnet, 0x6f for testnet)
    pub p2pkh_prefix: u8,
    /// P2SH address prefix (e.g., 0x05 for mainnet, 0xc4 for testnet)
    pub p2sh_prefix: u8,
    /// SLIP-44 coin type used in account derivation paths
    pub slip44: u32,
    /// Bitcoin network (mainnet, testnet, regtest)
    pub network: Network,
}

impl NetworkParams {
    /// Create network parameters for mainnet
    pub fn mainnet() -> Self {
        Self {
            bech32_prefix: String::from("bc"),
            p2pkh_prefix: 0x00,
            p2sh_prefix: 0x05,
            slip44: 0,
            network: Network::Bitcoin,
        }
    }

    /// Create network parameters for testnet
    pub fn testnet() -> Self {
        Self {
            bech32_prefix: String::from("tb"),
            p2pkh_prefix: 0x6f,
            p2sh_prefix: 0xc4,
            slip44: 1,
            network: Network::Testnet,
        }
    }

    /// Create network parameters for regtest
    pub fn regtest() -> Self {
        Self {
            bech32_prefix: String::from("bcrt"),
            p2pkh_prefix: 0x64,
            p2sh_prefix: 0xc4,
            slip44: 1,
            network: Network::Regtest,
        }
    }

    /// Create network parameters from a network name or a magic string in
    /// the format "p2sh_prefix:p2pkh_prefix:bech32_prefix:slip44".
    /// Custom chains reuse mainnet address encoding.
    pub fn from_magic(magic: &str) -> Result<Self, String> {
        match magic.to_lowercase().as_str() {
            "mainnet" => Ok(Self::mainnet()),
            "testnet" => Ok(Self::testnet()),
            "regtest" | "localhost" => Ok(Self::regtest()),
            _ => {
                let parts: Vec<&str> = magic.split(':').collect();
                if parts.len() != 4 {
                    return Err(format!(
                        "Invalid magic format. Expected network name (mainnet, testnet, regtest) \
                         or 'p2sh_prefix:p2pkh_prefix:bech32_prefix:slip44', got '{}'",
                        magic
                    ));
                }

                let p2sh_prefix = u8::from_str_radix(parts[0], 16)
                    .map_err(|_| format!("Invalid p2sh_prefix: {}", parts[0]))?;
                let p2pkh_prefix = u8::from_str_radix(parts[1], 16)
                    .map_err(|_| format!("Invalid p2pkh_prefix: {}", parts[1]))?;
                let bech32_prefix = parts[2].to_string();
                let slip44 = parts[3]
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid slip44: {}", parts[3]))?;

                Ok(Self {
                    bech32_prefix,
                    p2pkh_prefix,
                    p2sh_prefix,
                    slip44,
                    network: Network::Bitcoin,
                })
            }
        }
    }

    /// True when the given address string is a segwit address on this network.
    pub fn is_segwit_address(&self, address: &str) -> bool {
        address.starts_with(&self.bech32_prefix)
    }
}
