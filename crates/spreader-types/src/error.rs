//! Error types for the stake spreader
//!
//! Every failure inside a round is caught at the round boundary. Only
//! `CatalogUnavailable` and `InvalidPolicy` are allowed to end a run.

use thiserror::Error;

/// Result type for spreader operations
pub type Result<T> = std::result::Result<T, SpreaderError>;

/// Spreader error types
#[derive(Debug, Clone, Error)]
pub enum SpreaderError {
    // ========================================================================
    // Ledger Client Errors
    // ========================================================================

    /// A ledger call failed; no state change is assumed
    #[error("Ledger call `{call}` failed: {message}")]
    TransientRpc { call: String, message: String },

    /// A ledger call exceeded the outer timeout
    #[error("Ledger call `{call}` timed out after {secs}s")]
    Timeout { call: String, secs: u64 },

    /// The ledger answered with something we could not interpret
    #[error("Malformed response from `{call}`: {message}")]
    MalformedResponse { call: String, message: String },

    // ========================================================================
    // Coordination Errors
    // ========================================================================

    /// The ledger contradicts the lock state the coordinator just set
    #[error("Invariant violated during {step} for entry {entry}: {detail}")]
    InvariantViolation {
        step: String,
        entry: String,
        detail: String,
    },

    /// The target was consumed by someone else before the broadcast
    #[error("Target entry {entry} is no longer in the catalog")]
    TargetVanished { entry: String },

    // ========================================================================
    // Fatal Errors
    // ========================================================================

    /// Catalog access failed more times in a row than the retry ceiling allows
    #[error("Entry catalog unavailable after {attempts} consecutive attempts")]
    CatalogUnavailable { attempts: u32 },

    /// Policy or configuration cannot produce a valid fan-out
    #[error("Invalid policy: {message}")]
    InvalidPolicy { message: String },
}

impl SpreaderError {
    /// Create a transient RPC error
    pub fn rpc(call: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientRpc {
            call: call.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed(call: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            call: call.into(),
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(
        step: impl Into<String>,
        entry: impl ToString,
        detail: impl Into<String>,
    ) -> Self {
        Self::InvariantViolation {
            step: step.into(),
            entry: entry.to_string(),
            detail: detail.into(),
        }
    }

    /// Create an invalid policy error
    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            message: message.into(),
        }
    }

    /// Check if the failure is worth retrying without operator action
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientRpc { .. }
                | Self::Timeout { .. }
                | Self::MalformedResponse { .. }
                | Self::InvariantViolation { .. }
                | Self::TargetVanished { .. }
        )
    }

    /// Short machine-readable code, used as a log field
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientRpc { .. } => "TRANSIENT_RPC",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::TargetVanished { .. } => "TARGET_VANISHED",
            Self::CatalogUnavailable { .. } => "CATALOG_UNAVAILABLE",
            Self::InvalidPolicy { .. } => "INVALID_POLICY",
        }
    }
}

impl From<serde_json::Error> for SpreaderError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse {
            call: "json".to_string(),
            message: e.to_string(),
        }
    }
}
