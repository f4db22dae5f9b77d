// Event handlers
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::event::Event;

/// Something that consumes events delivered by the bus.
///
/// A returned error is counted and logged by the bus; it never reaches the
/// publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.func)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn("award-badge", |event| async move {
///     println!("{}", event.event_type());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> SharedHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        func,
    })
}
