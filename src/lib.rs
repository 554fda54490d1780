//! Attesta wallet library
//!
//! Assembles, signs and conditionally notarizes UTXO transactions that may
//! carry colored-coin asset allocations, against a Blockbook-style backend:
//! - UTXO sanitization into a type-safe input representation
//! - PSBT construction with witness/legacy input disambiguation
//! - Interchangeable signing backends (local HD seed, hardware device)
//! - Notarization coordination: detect, fetch, splice, re-sign
//! - Send orchestration and broadcast

pub mod asset;
pub mod backend;
pub mod error;
pub mod network;
pub mod notary;
pub mod psbt;
pub mod send;
pub mod signer;
pub mod storage;
pub mod utxo;

pub use backend::{BackendClient, BackendConfig, BroadcastResult};
pub use error::{Result, WalletError};
pub use network::NetworkParams;
pub use send::{SendCoordinator, SendOutcome};
pub use signer::hardware::{HardwareDevice, HardwareSigner};
pub use signer::seed::SeedSigner;
pub use signer::Signer;
