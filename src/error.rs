//! Error taxonomy for the attesta library
//!
//! Every fallible operation returns the typed [`WalletError`]. Union-shaped
//! backend responses are converted into tagged values at the HTTP boundary,
//! so the variants here describe failures only. Incomplete signatures are
//! not an error anywhere in the crate; they travel as normal return values.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Caller-facing numeric code attached to send-path failures.
pub const SEND_ERROR_CODE: u32 = 402;

#[derive(Debug, Error)]
pub enum WalletError {
    /// The backend could not be reached or refused the request.
    #[error("backend request failed: {message}")]
    Backend { message: String },

    /// The backend answered with a shape this library does not recognize.
    #[error("unrecognized response from backend: {body}")]
    UnrecognizedResponse { body: String },

    /// The backend explicitly rejected a broadcast transaction.
    #[error("could not send tx: {message}")]
    BroadcastRejected { message: String },

    /// A notary endpoint did not answer at all.
    #[error("no response from notary")]
    NotaryUnreachable,

    /// A notary endpoint answered with an error field.
    #[error("notarization denied: {0}")]
    NotaryDenied(String),

    /// The hardware device produced a transaction this library cannot use.
    #[error("hardware device incompatible: {0}")]
    DeviceIncompatible(String),

    /// Refreshing an address index from the backend failed twice.
    #[error("could not update xpub {branch} index")]
    IndexRefresh { branch: &'static str },

    /// An account index referenced an account that was never derived.
    #[error("account {0} does not exist, derive it first")]
    UnknownAccount(usize),

    /// The allocation payload in an OP_RETURN output did not decode.
    #[error("invalid allocation payload: {0}")]
    AllocationCodec(String),

    /// Persisted signer state could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// A transaction output carried neither a script nor an address.
    #[error("planned output {0} has neither script nor address")]
    OutputMissingDestination(usize),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("invalid mnemonic: {0}")]
    Mnemonic(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    /// A structural problem prevented extracting the final transaction.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Extraction refused a fee rate above the configured ceiling.
    #[error("fee rate {actual} sat/vB exceeds maximum {maximum} sat/vB")]
    FeeRateTooHigh { actual: i64, maximum: i64 },

    #[error("psbt error: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    #[error("bip32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("key error: {0}")]
    Key(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WalletError {
    /// Caller-facing numeric code, matching the contract wallet frontends
    /// already rely on: send-path and notary failures carry 402, caller
    /// mistakes carry 400, local state problems carry 500.
    pub fn code(&self) -> u32 {
        match self {
            WalletError::Backend { .. }
            | WalletError::UnrecognizedResponse { .. }
            | WalletError::BroadcastRejected { .. }
            | WalletError::NotaryUnreachable
            | WalletError::NotaryDenied(_)
            | WalletError::IndexRefresh { .. }
            | WalletError::Http(_) => SEND_ERROR_CODE,
            WalletError::UnknownAccount(_)
            | WalletError::AllocationCodec(_)
            | WalletError::OutputMissingDestination(_)
            | WalletError::Address(_)
            | WalletError::Mnemonic(_)
            | WalletError::Extraction(_)
            | WalletError::FeeRateTooHigh { .. } => 400,
            WalletError::DeviceIncompatible(_) => 409,
            _ => 500,
        }
    }
}
