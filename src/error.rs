//! Error taxonomy.
//!
//! `ServiceError` describes failures reported by the remote negotiation
//! service (carrying protocol result codes where present). `TradeError` is
//! the engine-level error, classified into transient, protocol, data
//! integrity and unavailability failures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{ProposalId, Sku};

// ---------------------------------------------------------------------------
// Protocol result codes
// ---------------------------------------------------------------------------

/// Result codes the remote service attaches to rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Fail,
    InvalidState,
    AccessDenied,
    Timeout,
    ServiceUnavailable,
    Revoked,
    AlreadyRedeemed,
    Other(i32),
}

impl ResultCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => ResultCode::Fail,
            11 => ResultCode::InvalidState,
            15 => ResultCode::AccessDenied,
            16 => ResultCode::Timeout,
            20 => ResultCode::ServiceUnavailable,
            26 => ResultCode::Revoked,
            28 => ResultCode::AlreadyRedeemed,
            other => ResultCode::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ResultCode::Fail => 2,
            ResultCode::InvalidState => 11,
            ResultCode::AccessDenied => 15,
            ResultCode::Timeout => 16,
            ResultCode::ServiceUnavailable => 20,
            ResultCode::Revoked => 26,
            ResultCode::AlreadyRedeemed => 28,
            ResultCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Other(code) => write!(f, "{code}"),
            named => write!(f, "{named:?} ({})", named.code()),
        }
    }
}

// ---------------------------------------------------------------------------
// Service errors
// ---------------------------------------------------------------------------

/// Failure reported by (or while talking to) the remote negotiation service.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("No match")]
    NoMatch,

    #[error("Rejected ({code}): {message}")]
    Rejected { code: ResultCode, message: String },

    #[error("Rejected with cause {cause}: {message}")]
    Cause { cause: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

const NOT_ACTIVE_MESSAGE: &str = "is not active, so it may not be accepted";
const IGNORED_CONFIRMATION_MESSAGES: [&str; 2] = [
    "Could not act on confirmation",
    "Could not find confirmation for object",
];
const FATAL_SEND_MESSAGES: [&str; 3] = [
    "can only be sent to friends",
    "is not available to trade",
    "maximum number of items allowed",
];

impl ServiceError {
    pub fn rejected(code: ResultCode, message: impl Into<String>) -> Self {
        ServiceError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            ServiceError::Rejected { message, .. } | ServiceError::Cause { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            ServiceError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Session dropped; re-establishing it makes the call worth repeating.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, ServiceError::NotLoggedIn)
    }

    /// The proposal is no longer actionable. Never retried or alerted.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self.result_code(),
            Some(ResultCode::InvalidState) | Some(ResultCode::AlreadyRedeemed)
        ) || self.message().contains(NOT_ACTIVE_MESSAGE)
    }

    /// Confirmation errors meaning someone already acted on it.
    pub fn is_ignored_confirmation_error(&self) -> bool {
        let message = self.message();
        IGNORED_CONFIRMATION_MESSAGES
            .iter()
            .any(|m| message.contains(m))
    }

    /// Accept failures that repeating the call cannot fix.
    pub fn is_fatal_for_accept(&self) -> bool {
        matches!(self, ServiceError::Rejected { .. } | ServiceError::Cause { .. })
            || self.is_invalid_state()
    }

    /// Send failures with a message the remote will repeat on every attempt.
    pub fn is_fatal_send_message(&self) -> bool {
        let message = self.message();
        FATAL_SEND_MESSAGES.iter().any(|m| message.contains(m))
    }
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Broad failure classes used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network or session trouble. Retried with backoff.
    Transient,
    /// Remote rejected the request. Recovery depends on the code.
    Protocol,
    /// Internal inconsistency. Fatal for the current action, always alerted.
    DataIntegrity,
    /// External dependency down. Deferred, not counted.
    Unavailable,
}

#[derive(Debug, Error)]
pub enum TradeError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Proposal {0} carries no recorded valuation")]
    MissingValuation(ProposalId),

    #[error("Missing prices for {}", join_skus(.0))]
    MissingPrices(Vec<Sku>),

    #[error("No fallback item available in partner inventory")]
    NoFallbackItem,

    #[error("Remainder of {remainder} cannot be covered by the smallest denomination {smallest}")]
    UnresolvableRemainder { remainder: Decimal, smallest: Decimal },

    #[error("Counter left unbalanced by {0}")]
    Unbalanced(Decimal),

    #[error("Cannot move {count} of {sku}: count out of range")]
    CountOutOfRange { sku: Sku, count: Decimal },

    #[error("Value mismatch after balancing: our {our} vs their {their}")]
    ValueMismatch { our: Decimal, their: Decimal },

    #[error("Not enough {sku} to {verb} {missing} more")]
    InsufficientItems {
        sku: Sku,
        verb: &'static str,
        missing: i64,
    },

    #[error("Inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("Unknown proposal {0}")]
    UnknownOffer(ProposalId),

    #[error("Decision handler failed: {0}")]
    Handler(String),
}

fn join_skus(skus: &[Sku]) -> String {
    skus.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl TradeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TradeError::Service(ServiceError::Rejected { .. })
            | TradeError::Service(ServiceError::Cause { .. })
            | TradeError::Service(ServiceError::NoMatch) => ErrorClass::Protocol,
            TradeError::Service(_) => ErrorClass::Transient,
            TradeError::InventoryUnavailable(_) => ErrorClass::Unavailable,
            _ => ErrorClass::DataIntegrity,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            TradeError::Service(err) => Some(err),
            _ => None,
        }
    }

    /// Rejections meaning the proposal is already gone or acted on.
    pub fn is_invalid_state(&self) -> bool {
        self.as_service().is_some_and(ServiceError::is_invalid_state)
    }

    /// Whether repeating the same action later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TradeError::Service(err) => !err.is_fatal_for_accept(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::from_code(16), ResultCode::Timeout);
        assert_eq!(ResultCode::from_code(26), ResultCode::Revoked);
        assert_eq!(ResultCode::from_code(99), ResultCode::Other(99));
        assert_eq!(ResultCode::AlreadyRedeemed.code(), 28);
    }

    #[test]
    fn test_service_error_display() {
        let e = ServiceError::rejected(ResultCode::Timeout, "timed out");
        assert_eq!(format!("{e}"), "Rejected (Timeout (16)): timed out");
        assert_eq!(e.message(), "timed out");
    }

    #[test]
    fn test_invalid_state_detection() {
        assert!(ServiceError::rejected(ResultCode::InvalidState, "x").is_invalid_state());
        assert!(ServiceError::rejected(ResultCode::AlreadyRedeemed, "x").is_invalid_state());
        assert!(ServiceError::Other(
            "Offer #1 is not active, so it may not be accepted".into()
        )
        .is_invalid_state());
        assert!(!ServiceError::Transport("reset".into()).is_invalid_state());
    }

    #[test]
    fn test_ignored_confirmation_errors() {
        let e = ServiceError::Other("Could not find confirmation for object 123".into());
        assert!(e.is_ignored_confirmation_error());
        assert!(!ServiceError::NotLoggedIn.is_ignored_confirmation_error());
    }

    #[test]
    fn test_fatal_send_messages() {
        let e = ServiceError::Other("This trade offer can only be sent to friends".into());
        assert!(e.is_fatal_send_message());
        assert!(!ServiceError::Transport("socket hang up".into()).is_fatal_send_message());
    }

    #[test]
    fn test_trade_error_classes() {
        assert_eq!(
            TradeError::from(ServiceError::NotLoggedIn).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TradeError::from(ServiceError::rejected(ResultCode::Fail, "no")).class(),
            ErrorClass::Protocol
        );
        assert_eq!(TradeError::NoFallbackItem.class(), ErrorClass::DataIntegrity);
        assert_eq!(
            TradeError::InventoryUnavailable("down".into()).class(),
            ErrorClass::Unavailable
        );
    }

    #[test]
    fn test_retryable() {
        assert!(TradeError::from(ServiceError::Transport("reset".into())).is_retryable());
        assert!(!TradeError::from(ServiceError::rejected(ResultCode::Fail, "no")).is_retryable());
        assert!(!TradeError::NoFallbackItem.is_retryable());
    }

    #[test]
    fn test_trade_error_display() {
        let e = TradeError::MissingPrices(vec![Sku::new("200;6"), Sku::new("5021;6")]);
        assert_eq!(format!("{e}"), "Missing prices for 200;6, 5021;6");

        let e = TradeError::UnresolvableRemainder {
            remainder: dec!(1),
            smallest: dec!(3),
        };
        assert!(format!("{e}").contains("smallest denomination 3"));
    }
}
