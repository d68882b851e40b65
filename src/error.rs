//! Error types shared by the ring buffer, the processors and the
//! reactive-streams surface.

/// Errors produced by the ringflow runtime.
///
/// `Alert` and `Cancel` are control-flow signals: they unwind a waiting
/// consumer or a publishing producer and are never routed to a subscriber's
/// `on_error`. The remaining variants are genuine failures and follow the
/// reactive-streams propagation rules.
///
/// The enum is `Clone` because a terminal error published by a producer fans
/// out to every live subscriber of a broadcast processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The barrier backing a wait was alerted (cancellation or shutdown).
    #[error("sequence barrier alerted")]
    Alert,

    /// A producer discovered its consumers are gone; unwind the publish.
    #[error("publisher cancelled: no remaining subscribers")]
    Cancel,

    /// A non-blocking claim found the buffer full.
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// Invalid demand, buffer size or concurrency.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not legal in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A downstream subscriber callback failed. `value` carries a rendering
    /// of the offending element when the adapter had one.
    #[error("subscriber failure: {message}")]
    Subscriber {
        message: String,
        value: Option<String>,
    },
}

impl RingError {
    /// Attach the offending value to a subscriber failure, keeping any value
    /// already recorded.
    pub(crate) fn with_value(self, rendered: String) -> Self {
        match self {
            RingError::Subscriber {
                message,
                value: None,
            } => RingError::Subscriber {
                message,
                value: Some(rendered),
            },
            other => other,
        }
    }

    /// True for the control-flow variants that must never reach `on_error`.
    pub fn is_control(&self) -> bool {
        matches!(self, RingError::Alert | RingError::Cancel)
    }
}

pub type Result<T> = std::result::Result<T, RingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_signals_are_flagged() {
        assert!(RingError::Alert.is_control());
        assert!(RingError::Cancel.is_control());
        assert!(!RingError::InsufficientCapacity.is_control());
        assert!(!RingError::InvalidArgument("n".into()).is_control());
    }

    #[test]
    fn with_value_keeps_existing_rendering() {
        let err = RingError::Subscriber {
            message: "boom".into(),
            value: Some("first".into()),
        };
        let kept = err.with_value("second".into());
        assert_eq!(
            kept,
            RingError::Subscriber {
                message: "boom".into(),
                value: Some("first".into()),
            }
        );
    }

    #[test]
    fn with_value_fills_empty_slot() {
        let err = RingError::Subscriber {
            message: "boom".into(),
            value: None,
        };
        match err.with_value("42".into()) {
            RingError::Subscriber { value, .. } => assert_eq!(value.as_deref(), Some("42")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
