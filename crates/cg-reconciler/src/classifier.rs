//! Fatal-outcome classification for consumer-side failures
//!
//! A fatal failure is one that will fail again on every redelivery (the body
//! cannot be decoded, no handler exists, ...). Such messages are dropped and
//! surfaced instead of requeued. Routing keys on the retry allow-list are
//! always treated as recoverable.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Why processing a delivered message failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Payload could not be decoded into the expected type
    Decode(String),
    /// Payload decoded but failed validation
    Validation(String),
    /// No handler is registered for the message
    NoHandler(String),
    /// Handler received an argument of the wrong type
    TypeMismatch(String),
    /// Handler returned an error
    Handler(String),
    /// Handler timed out
    Timeout(String),
    /// A downstream dependency was unavailable
    Unavailable(String),
}

impl FailureCause {
    pub fn kind(&self) -> &'static str {
        match self {
            FailureCause::Decode(_) => "decode",
            FailureCause::Validation(_) => "validation",
            FailureCause::NoHandler(_) => "no_handler",
            FailureCause::TypeMismatch(_) => "type_mismatch",
            FailureCause::Handler(_) => "handler",
            FailureCause::Timeout(_) => "timeout",
            FailureCause::Unavailable(_) => "unavailable",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            FailureCause::Decode(d)
            | FailureCause::Validation(d)
            | FailureCause::NoHandler(d)
            | FailureCause::TypeMismatch(d)
            | FailureCause::Handler(d)
            | FailureCause::Timeout(d)
            | FailureCause::Unavailable(d) => d,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.detail())
    }
}

/// What the consumer should do with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Drop the message and report it; never requeue
    Discard,
    /// Hand back to the broker for requeue or dead-lettering
    Requeue,
}

/// Generic rule for which causes are fatal, independent of routing key
pub trait FatalStrategy: Send + Sync {
    fn is_fatal(&self, cause: &FailureCause) -> bool;
}

/// Causes that cannot succeed on redelivery are fatal
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFatalStrategy;

impl FatalStrategy for DefaultFatalStrategy {
    fn is_fatal(&self, cause: &FailureCause) -> bool {
        matches!(
            cause,
            FailureCause::Decode(_)
                | FailureCause::Validation(_)
                | FailureCause::NoHandler(_)
                | FailureCause::TypeMismatch(_)
        )
    }
}

/// Fatal strategy plus a routing key allow-list that must always be retried
#[derive(Clone)]
pub struct FatalOutcomeClassifier {
    strategy: Arc<dyn FatalStrategy>,
    retry_routing_keys: HashSet<String>,
}

impl FatalOutcomeClassifier {
    pub fn new<I, S>(retry_routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_strategy(Arc::new(DefaultFatalStrategy), retry_routing_keys)
    }

    pub fn with_strategy<I, S>(strategy: Arc<dyn FatalStrategy>, retry_routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            strategy,
            retry_routing_keys: retry_routing_keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_retry_routing_key(&self, routing_key: &str) -> bool {
        self.retry_routing_keys.contains(routing_key)
    }

    pub fn is_fatal(&self, routing_key: &str, cause: &FailureCause) -> bool {
        !self.is_retry_routing_key(routing_key) && self.strategy.is_fatal(cause)
    }

    pub fn disposition(&self, routing_key: &str, cause: &FailureCause) -> FailureDisposition {
        if self.is_fatal(routing_key, cause) {
            FailureDisposition::Discard
        } else {
            FailureDisposition::Requeue
        }
    }
}

impl fmt::Debug for FatalOutcomeClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalOutcomeClassifier")
            .field("retry_routing_keys", &self.retry_routing_keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy() {
        let strategy = DefaultFatalStrategy;
        assert!(strategy.is_fatal(&FailureCause::Decode("bad json".into())));
        assert!(strategy.is_fatal(&FailureCause::Validation("missing id".into())));
        assert!(strategy.is_fatal(&FailureCause::NoHandler("order.cancel".into())));
        assert!(strategy.is_fatal(&FailureCause::TypeMismatch("expected Order".into())));
        assert!(!strategy.is_fatal(&FailureCause::Handler("db write failed".into())));
        assert!(!strategy.is_fatal(&FailureCause::Timeout("30s".into())));
        assert!(!strategy.is_fatal(&FailureCause::Unavailable("db".into())));
    }

    #[test]
    fn test_allow_list_overrides_fatal() {
        let classifier = FatalOutcomeClassifier::new(["order.save"]);
        let cause = FailureCause::Decode("bad json".into());

        assert!(!classifier.is_fatal("order.save", &cause));
        assert!(classifier.is_fatal("order.cancel", &cause));
        assert_eq!(classifier.disposition("order.save", &cause), FailureDisposition::Requeue);
        assert_eq!(classifier.disposition("order.cancel", &cause), FailureDisposition::Discard);
    }

    #[test]
    fn test_recoverable_is_never_fatal() {
        let classifier = FatalOutcomeClassifier::new(Vec::<String>::new());
        let cause = FailureCause::Handler("boom".into());
        assert!(!classifier.is_fatal("anything", &cause));
        assert_eq!(classifier.disposition("anything", &cause), FailureDisposition::Requeue);
    }

    #[test]
    fn test_custom_strategy() {
        struct EverythingFatal;
        impl FatalStrategy for EverythingFatal {
            fn is_fatal(&self, _cause: &FailureCause) -> bool {
                true
            }
        }

        let classifier = FatalOutcomeClassifier::with_strategy(Arc::new(EverythingFatal), ["order.save"]);
        let cause = FailureCause::Timeout("5s".into());
        assert!(classifier.is_fatal("order.cancel", &cause));
        assert!(!classifier.is_fatal("order.save", &cause));
    }

    #[test]
    fn test_cause_display() {
        let cause = FailureCause::Decode("unexpected token".into());
        assert_eq!(cause.to_string(), "decode: unexpected token");
    }
}
