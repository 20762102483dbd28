//! Correlation strategies: message -> correlation key.

use correlator_core::{headers, CorrelationKey, Message};

use crate::error::EngineError;

/// Computes the correlation key of a message.
///
/// Must be deterministic: the same message always maps to the same key.
///
/// Used as `Arc<dyn CorrelationStrategy>`.
pub trait CorrelationStrategy: Send + Sync {
    /// Returns the key of the group `message` belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingCorrelationKey`] when no key can be
    /// derived. The message is then rejected, never silently dropped.
    fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError>;
}

/// Reads the key from a header (default: `correlationId`).
///
/// Scalar string, integer, and boolean header values are accepted; anything
/// else, or an absent header, is a missing key.
#[derive(Debug, Clone)]
pub struct HeaderCorrelationStrategy {
    header: String,
}

impl HeaderCorrelationStrategy {
    /// Correlates on the named header.
    #[must_use]
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }
}

impl Default for HeaderCorrelationStrategy {
    fn default() -> Self {
        Self::new(headers::CORRELATION_ID)
    }
}

impl CorrelationStrategy for HeaderCorrelationStrategy {
    fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
        message
            .headers()
            .get(&self.header)
            .and_then(CorrelationKey::from_value)
            .ok_or(EngineError::MissingCorrelationKey {
                message_id: message.id(),
            })
    }
}

/// Correlates with a caller-supplied function.
pub struct FnCorrelationStrategy<F> {
    f: F,
}

impl<F> FnCorrelationStrategy<F>
where
    F: Fn(&Message) -> Option<CorrelationKey> + Send + Sync,
{
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> CorrelationStrategy for FnCorrelationStrategy<F>
where
    F: Fn(&Message) -> Option<CorrelationKey> + Send + Sync,
{
    fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
        (self.f)(message).ok_or(EngineError::MissingCorrelationKey {
            message_id: message.id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use correlator_core::{MessageBuilder, Value};

    use super::*;

    #[test]
    fn default_strategy_reads_correlation_id() {
        let message = MessageBuilder::with_payload("x").correlation_id("ABC").build();
        let key = HeaderCorrelationStrategy::default()
            .correlation_key(&message)
            .unwrap();
        assert_eq!(key, CorrelationKey::new("ABC"));
    }

    #[test]
    fn integer_keys_are_accepted() {
        let message = MessageBuilder::with_payload("x").correlation_id(42).build();
        let key = HeaderCorrelationStrategy::default()
            .correlation_key(&message)
            .unwrap();
        assert_eq!(key, CorrelationKey::Int(42));
    }

    #[test]
    fn missing_header_is_an_error() {
        let message = Message::new("x");
        let err = HeaderCorrelationStrategy::default()
            .correlation_key(&message)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingCorrelationKey { message_id } if message_id == message.id()
        ));
    }

    #[test]
    fn structured_header_values_are_not_keys() {
        let message = MessageBuilder::with_payload("x")
            .correlation_id(Value::Array(vec![Value::from("a")]))
            .build();
        assert!(HeaderCorrelationStrategy::default()
            .correlation_key(&message)
            .is_err());
    }

    #[test]
    fn custom_header_name() {
        let strategy = HeaderCorrelationStrategy::new("orderId");
        let message = MessageBuilder::with_payload("x").header("orderId", "o-7").build();
        assert_eq!(strategy.header(), "orderId");
        assert_eq!(
            strategy.correlation_key(&message).unwrap(),
            CorrelationKey::new("o-7")
        );
    }

    #[test]
    fn fn_strategy_uses_closure() {
        let strategy = FnCorrelationStrategy::new(|m: &Message| {
            m.payload()
                .as_str()
                .and_then(|s| s.split(':').next())
                .map(CorrelationKey::from)
        });
        let key = strategy.correlation_key(&Message::new("batch-1:item")).unwrap();
        assert_eq!(key, CorrelationKey::new("batch-1"));

        let err = strategy.correlation_key(&Message::new(5)).unwrap_err();
        assert!(err.is_rejection());
    }
}
