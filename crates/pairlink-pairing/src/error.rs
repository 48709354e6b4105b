//! Error types for the pairing layer.

/// A failure reported by the backing key-value store.
#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Errors that can occur while pairing or reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// Every freshly generated code collided with an existing record.
    #[error("could not allocate a unique pairing code after {attempts} attempts")]
    CodeAllocation {
        /// Codes tried.
        attempts: u32,
    },

    /// The code is not shaped like `XXXX-XXXX`.
    #[error("invalid pairing code format, expected XXXX-XXXX")]
    InvalidCode,

    /// No pairing record exists for the code.
    #[error("pairing code not found")]
    CodeNotFound,

    /// The pairing record exists but its expiry has passed.
    #[error("pairing code expired")]
    CodeExpired,

    /// No user or device record exists for the token.
    #[error("{kind} token not found")]
    TokenNotFound {
        /// `"user"` or `"device"`.
        kind: &'static str,
    },

    /// A required input was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored record could not be encoded or decoded.
    #[error("malformed record: {0}")]
    Serde(#[from] serde_json::Error),
}
