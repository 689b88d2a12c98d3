//! Consumer and validator seams, plus the consumer lifestyle wrappers.

use crate::errors::ValidationError;
use crate::message::{Delivery, SchemaId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Failure raised by a consumer callback; handed to the failed-delivery strategy.
#[derive(Debug, Error)]
#[error("consumer failed: {reason}")]
pub struct ConsumerError {
    /// Consumer-supplied failure detail.
    pub reason: String,
}

impl ConsumerError {
    /// Builds a failure with the given detail.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Application callback receiving messages for one label.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Handles one delivered message.
    async fn consume(&self, delivery: Delivery) -> Result<(), ConsumerError>;
}

/// Late-bound constructor for consumers, registered in the component registry.
///
/// Whether repeated invocations return one shared instance or fresh ones is
/// the registrant's choice.
pub type ConsumerFactory = Arc<dyn Fn() -> Arc<dyn MessageConsumer> + Send + Sync>;

/// Wrapper that builds its consumer on the first message and memoizes it.
pub struct LazyConsumer {
    factory: ConsumerFactory,
    instance: OnceCell<Arc<dyn MessageConsumer>>,
}

impl LazyConsumer {
    /// Wraps `factory`, deferring the single invocation to the first message.
    pub fn new(factory: ConsumerFactory) -> Self {
        Self {
            factory,
            instance: OnceCell::new(),
        }
    }
}

#[async_trait]
impl MessageConsumer for LazyConsumer {
    async fn consume(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        let consumer = self
            .instance
            .get_or_init(|| async { (self.factory)() })
            .await;
        consumer.consume(delivery).await
    }
}

/// Wrapper that builds a fresh consumer for every message.
pub struct DelegatedConsumer {
    factory: ConsumerFactory,
}

impl DelegatedConsumer {
    /// Wraps `factory`, invoking it once per message.
    pub fn new(factory: ConsumerFactory) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl MessageConsumer for DelegatedConsumer {
    async fn consume(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        (self.factory)().consume(delivery).await
    }
}

/// Policy applied to a message that a consumer or validator rejects.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailedDeliveryStrategy {
    /// Nack with requeue; the broker redelivers.
    #[default]
    Requeue,
    /// Nack without requeue; the broker dead-letters.
    DeadLetter,
    /// Acknowledge and drop.
    Drop,
}

/// Checks a message before its consumer runs.
pub trait PayloadValidator: Send + Sync {
    /// Schema this validator applies to, `None` for any payload.
    fn schema(&self) -> Option<SchemaId> {
        None
    }

    /// Accepts or rejects one delivery.
    fn validate(&self, delivery: &Delivery) -> Result<(), ValidationError>;
}

/// A named group of validators applied in registration order.
///
/// The group rejects on the first failing member.
pub struct ValidatorGroup {
    validators: Vec<Arc<dyn PayloadValidator>>,
}

impl ValidatorGroup {
    /// Builds a group from its members.
    pub fn new(validators: Vec<Arc<dyn PayloadValidator>>) -> Self {
        Self { validators }
    }
}

impl PayloadValidator for ValidatorGroup {
    fn validate(&self, delivery: &Delivery) -> Result<(), ValidationError> {
        for validator in &self.validators {
            validator.validate(delivery)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConsumerError, ConsumerFactory, DelegatedConsumer, LazyConsumer, MessageConsumer,
        PayloadValidator, ValidatorGroup,
    };
    use crate::errors::ValidationError;
    use crate::label::MessageLabel;
    use crate::message::{Delivery, Headers, Payload};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn delivery() -> Delivery {
        Delivery {
            label: MessageLabel::new("order.created"),
            headers: Headers::new(),
            payload: Payload::Untyped(serde_json::Map::new()),
            tag: 1,
        }
    }

    struct CountingConsumer {
        consumed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageConsumer for CountingConsumer {
        async fn consume(&self, _delivery: Delivery) -> Result<(), ConsumerError> {
            self.consumed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_factory() -> (ConsumerFactory, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));
        let built_in_factory = built.clone();
        let consumed_in_factory = consumed.clone();
        let factory: ConsumerFactory = Arc::new(move || {
            built_in_factory.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingConsumer {
                consumed: consumed_in_factory.clone(),
            }) as Arc<dyn MessageConsumer>
        });
        (factory, built, consumed)
    }

    #[tokio::test]
    async fn lazy_consumer_builds_once_on_first_message() {
        let (factory, built, consumed) = counting_factory();
        let lazy = LazyConsumer::new(factory);

        assert_eq!(built.load(Ordering::SeqCst), 0);
        lazy.consume(delivery()).await.unwrap();
        lazy.consume(delivery()).await.unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(consumed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delegated_consumer_builds_per_message() {
        let (factory, built, consumed) = counting_factory();
        let delegated = DelegatedConsumer::new(factory);

        delegated.consume(delivery()).await.unwrap();
        delegated.consume(delivery()).await.unwrap();
        delegated.consume(delivery()).await.unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 3);
        assert_eq!(consumed.load(Ordering::SeqCst), 3);
    }

    struct RejectingValidator;

    impl PayloadValidator for RejectingValidator {
        fn validate(&self, _delivery: &Delivery) -> Result<(), ValidationError> {
            Err(ValidationError::new("nope"))
        }
    }

    struct AcceptingValidator;

    impl PayloadValidator for AcceptingValidator {
        fn validate(&self, _delivery: &Delivery) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    #[test]
    fn validator_group_rejects_on_first_failing_member() {
        let group = ValidatorGroup::new(vec![
            Arc::new(AcceptingValidator),
            Arc::new(RejectingValidator),
        ]);
        assert!(group.validate(&delivery()).is_err());

        let all_pass = ValidatorGroup::new(vec![Arc::new(AcceptingValidator)]);
        assert!(all_pass.validate(&delivery()).is_ok());
    }
}
