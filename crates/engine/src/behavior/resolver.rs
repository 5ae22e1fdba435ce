//! Activity type to behavior mapping

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{ActivityType, ModelError};

use super::container::{CallActivity, EventSubProcess, SubProcess};
use super::event::{
    BoundaryEvent, ConditionalCatch, ErrorEnd, EscalationThrow, EventStart, MessageCatch,
    PassThroughEvent, TerminateEnd, TimerCatch,
};
use super::gateway::{EventBasedGateway, ExclusiveGateway, InclusiveGateway, ParallelGateway};
use super::task::{ImmediateTask, WaitingTask};
use super::{Cancellable, Completable, Failable, Runnable, Triggerable};

/// Capabilities of one activity type
#[derive(Clone)]
pub struct Behavior {
    pub runnable: Arc<dyn Runnable>,
    pub completable: Option<Arc<dyn Completable>>,
    pub cancellable: Option<Arc<dyn Cancellable>>,
    pub failable: Option<Arc<dyn Failable>>,
    pub triggerable: Option<Arc<dyn Triggerable>>,
}

impl Behavior {
    pub fn builder<T: Runnable + 'static>(behavior: T) -> BehaviorBuilder<T> {
        BehaviorBuilder {
            inner: Arc::new(behavior),
            completable: None,
            cancellable: None,
            failable: None,
            triggerable: None,
        }
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("completable", &self.completable.is_some())
            .field("cancellable", &self.cancellable.is_some())
            .field("failable", &self.failable.is_some())
            .field("triggerable", &self.triggerable.is_some())
            .finish()
    }
}

/// Registers the capabilities a behavior implements
pub struct BehaviorBuilder<T> {
    inner: Arc<T>,
    completable: Option<Arc<dyn Completable>>,
    cancellable: Option<Arc<dyn Cancellable>>,
    failable: Option<Arc<dyn Failable>>,
    triggerable: Option<Arc<dyn Triggerable>>,
}

impl<T: Runnable + 'static> BehaviorBuilder<T> {
    pub fn completable(mut self) -> Self
    where
        T: Completable,
    {
        self.completable = Some(self.inner.clone());
        self
    }

    pub fn cancellable(mut self) -> Self
    where
        T: Cancellable,
    {
        self.cancellable = Some(self.inner.clone());
        self
    }

    pub fn failable(mut self) -> Self
    where
        T: Failable,
    {
        self.failable = Some(self.inner.clone());
        self
    }

    pub fn triggerable(mut self) -> Self
    where
        T: Triggerable,
    {
        self.triggerable = Some(self.inner.clone());
        self
    }

    pub fn build(self) -> Behavior {
        Behavior {
            runnable: self.inner,
            completable: self.completable,
            cancellable: self.cancellable,
            failable: self.failable,
            triggerable: self.triggerable,
        }
    }
}

/// Total mapping from activity type to behavior
#[derive(Debug, Clone)]
pub struct BehaviorResolver {
    behaviors: HashMap<ActivityType, Behavior>,
}

impl BehaviorResolver {
    /// Resolver with the built-in behavior of every activity type
    pub fn standard() -> Result<Self, ModelError> {
        let mut behaviors = HashMap::new();
        let mut register = |types: &[ActivityType], behavior: Behavior| {
            for ty in types {
                behaviors.insert(*ty, behavior.clone());
            }
        };

        register(
            &[
                ActivityType::StartEvent,
                ActivityType::EndEvent,
                ActivityType::ThrowEvent,
            ],
            Behavior::builder(PassThroughEvent)
                .completable()
                .cancellable()
                .build(),
        );
        register(
            &[
                ActivityType::MessageStartEvent,
                ActivityType::ErrorStartEvent,
                ActivityType::EscalationStartEvent,
                ActivityType::ConditionalStartEvent,
            ],
            Behavior::builder(EventStart)
                .completable()
                .cancellable()
                .triggerable()
                .build(),
        );
        register(
            &[ActivityType::TerminateEndEvent],
            Behavior::builder(TerminateEnd)
                .completable()
                .cancellable()
                .build(),
        );
        register(
            &[ActivityType::ErrorEndEvent],
            Behavior::builder(ErrorEnd)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[
                ActivityType::EscalationEndEvent,
                ActivityType::EscalationThrowEvent,
            ],
            Behavior::builder(EscalationThrow)
                .completable()
                .cancellable()
                .build(),
        );
        register(
            &[ActivityType::MessageCatchEvent],
            Behavior::builder(MessageCatch)
                .completable()
                .cancellable()
                .triggerable()
                .build(),
        );
        register(
            &[ActivityType::TimerCatchEvent],
            Behavior::builder(TimerCatch)
                .completable()
                .cancellable()
                .build(),
        );
        register(
            &[ActivityType::ConditionalCatchEvent],
            Behavior::builder(ConditionalCatch)
                .completable()
                .cancellable()
                .triggerable()
                .build(),
        );
        register(
            &[
                ActivityType::ErrorBoundaryEvent,
                ActivityType::EscalationBoundaryEvent,
                ActivityType::MessageBoundaryEvent,
                ActivityType::TimerBoundaryEvent,
                ActivityType::ConditionalBoundaryEvent,
            ],
            Behavior::builder(BoundaryEvent)
                .completable()
                .cancellable()
                .triggerable()
                .build(),
        );
        register(
            &[ActivityType::Task],
            Behavior::builder(ImmediateTask)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::ServiceTask, ActivityType::UserTask],
            Behavior::builder(WaitingTask)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::ExclusiveGateway],
            Behavior::builder(ExclusiveGateway)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::InclusiveGateway],
            Behavior::builder(InclusiveGateway)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::ParallelGateway],
            Behavior::builder(ParallelGateway)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::EventBasedGateway],
            Behavior::builder(EventBasedGateway)
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::SubProcess],
            Behavior::builder(SubProcess)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );
        register(
            &[ActivityType::EventSubProcess],
            Behavior::builder(EventSubProcess)
                .completable()
                .cancellable()
                .build(),
        );
        register(
            &[ActivityType::CallActivity],
            Behavior::builder(CallActivity)
                .completable()
                .cancellable()
                .failable()
                .build(),
        );

        let resolver = Self { behaviors };
        resolver.validate()?;
        Ok(resolver)
    }

    /// Replace the behavior of one type
    pub fn with(mut self, activity_type: ActivityType, behavior: Behavior) -> Self {
        self.behaviors.insert(activity_type, behavior);
        self
    }

    /// Fail unless every activity type has a behavior
    pub fn validate(&self) -> Result<(), ModelError> {
        match ActivityType::ALL
            .iter()
            .find(|ty| !self.behaviors.contains_key(*ty))
        {
            Some(missing) => Err(ModelError::MissingBehavior(*missing)),
            None => Ok(()),
        }
    }

    pub fn resolve(&self, activity_type: ActivityType) -> Result<&Behavior, ModelError> {
        self.behaviors
            .get(&activity_type)
            .ok_or(ModelError::MissingBehavior(activity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_is_total() {
        let resolver = BehaviorResolver::standard().unwrap();
        for ty in ActivityType::ALL {
            assert!(resolver.resolve(ty).is_ok(), "{ty} unmapped");
        }
    }

    #[test]
    fn test_capabilities() {
        let resolver = BehaviorResolver::standard().unwrap();

        let service = resolver.resolve(ActivityType::ServiceTask).unwrap();
        assert!(service.completable.is_some());
        assert!(service.failable.is_some());
        assert!(service.triggerable.is_none());

        let boundary = resolver.resolve(ActivityType::TimerBoundaryEvent).unwrap();
        assert!(boundary.triggerable.is_some());

        let race = resolver.resolve(ActivityType::EventBasedGateway).unwrap();
        assert!(race.completable.is_none());
        assert!(race.cancellable.is_some());
    }

    #[test]
    fn test_every_gateway_is_failable() {
        let resolver = BehaviorResolver::standard().unwrap();
        for ty in ActivityType::ALL.into_iter().filter(|t| t.is_gateway()) {
            assert!(resolver.resolve(ty).unwrap().failable.is_some(), "{ty} not failable");
        }
    }

    #[test]
    fn test_missing_behavior_fails_fast() {
        let mut resolver = BehaviorResolver::standard().unwrap();
        resolver.behaviors.remove(&ActivityType::UserTask);

        assert_eq!(
            resolver.validate(),
            Err(ModelError::MissingBehavior(ActivityType::UserTask))
        );
    }
}
