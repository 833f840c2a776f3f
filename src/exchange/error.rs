//! Gateway error taxonomy.
//!
//! Every fallible gateway call maps its failure into exactly one of these
//! classes; the executor's joint-outcome resolution depends on the
//! distinction between "proven not placed" and "outcome unknown".

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Throttling, timeouts, 5xx. Retried inside the gateway for queries.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Bad input the venue refused: unknown symbol, malformed request.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Quantity not a multiple of the instrument's step size. The gateway
    /// rejects rather than silently rounding.
    #[error("quantity {quantity} does not conform to step size {step}")]
    InvalidQuantity { quantity: Decimal, step: Decimal },

    /// The venue refused the order before placing it. Safe to treat as
    /// "did not happen".
    #[error("order rejected before placement: {0}")]
    RejectedPrePlace(String),

    /// A write whose outcome is unknown (network error mid-flight, timeout).
    /// Never retried; the caller reconciles by polling.
    #[error("write outcome unknown: {0}")]
    AmbiguousWrite(String),

    /// Credentials rejected. Unrecoverable; the process exits.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything the gateway cannot classify as recoverable.
    #[error("fatal gateway error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Errors a query may be retried on (with backoff, bounded attempts).
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// True when the response proves the order never reached the book, so
    /// no exchange-side position can exist because of it.
    pub fn proves_not_placed(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_)
                | GatewayError::InvalidQuantity { .. }
                | GatewayError::RejectedPrePlace(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejection_classes_prove_not_placed() {
        assert!(GatewayError::Validation("bad symbol".into()).proves_not_placed());
        assert!(GatewayError::RejectedPrePlace("insufficient balance".into()).proves_not_placed());
        assert!(GatewayError::InvalidQuantity {
            quantity: dec!(1.2345),
            step: dec!(0.01)
        }
        .proves_not_placed());
    }

    #[test]
    fn test_ambiguous_write_is_not_proven_absent() {
        assert!(!GatewayError::AmbiguousWrite("connection reset".into()).proves_not_placed());
        assert!(!GatewayError::Transient("429".into()).proves_not_placed());
    }
}
