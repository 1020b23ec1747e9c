use crate::models::Head;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type SubscriberFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + 'a>>;

/// Which [`HeadSubscriber`] hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStage {
    Connect,
    NewHead,
    Disconnect,
}

#[derive(Debug, thiserror::Error)]
#[error("{stage:?} hook of {subscriber} failed: {source}")]
pub struct SubscriberError {
    stage: SubscriberStage,
    subscriber: &'static str,
    #[source]
    source: AnyError,
}

impl SubscriberError {
    pub fn new(stage: SubscriberStage, subscriber: &'static str, source: AnyError) -> Self {
        Self {
            stage,
            subscriber,
            source,
        }
    }

    pub fn stage(&self) -> SubscriberStage {
        self.stage
    }

    pub fn subscriber(&self) -> &'static str {
        self.subscriber
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

/// Consumer of the head stream.
///
/// The tracker awaits each hook before moving on, so a subscriber sees head N
/// fully delivered to every subscriber before head N+1 arrives.
pub trait HeadSubscriber: Send + Sync + 'static {
    /// Stable name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called once when the tracker attaches, with the last persisted head.
    fn connect<'a>(&'a self, head: Option<&'a Head>) -> SubscriberFuture<'a>;

    fn on_new_head<'a>(&'a self, head: &'a Head) -> SubscriberFuture<'a>;

    fn disconnect<'a>(&'a self) -> SubscriberFuture<'a>;
}
