use super::event::SubscriptionEvent;
use async_trait::async_trait;

/// Callback invoked by the worker once per delivered event.
///
/// Runs inside the subscription's worker, before the event is queued. An
/// error is reported on the subscription's errors queue and delivery goes on.
/// A handler that never returns is abandoned when the subscription closes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &SubscriptionEvent) -> anyhow::Result<()>;
}

/// Adapter turning a plain closure into an [`EventHandler`]
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&SubscriptionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&SubscriptionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &SubscriptionEvent) -> anyhow::Result<()> {
        (self.handler)(event)
    }
}
