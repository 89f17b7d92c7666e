//! Presentation surfaces
//!
//! A surface is anything that wants to see assistant events: a console, a
//! status panel, a trace file. Each runs on its own task behind its own bus
//! subscription, so a slow or failing surface never affects the core or the
//! other surfaces. A surface that returns an error is unsubscribed.

mod console;
mod epaper;
mod trace;

pub use console::ConsoleSurface;
pub use epaper::{EpaperSurface, LogPanel, Panel};
pub use trace::TraceSurface;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::Result;
use crate::events::{AssistantEvent, EventBus};

/// Event consumer with independent lifetime
#[async_trait]
pub trait Surface: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle one event
    ///
    /// # Errors
    ///
    /// Any error detaches the surface from the bus
    async fn receive(&mut self, event: &AssistantEvent) -> Result<()>;
}

/// Subscribe `surface` to `bus` and deliver events until either side stops
pub fn spawn_surface(bus: &EventBus, mut surface: Box<dyn Surface>) -> JoinHandle<()> {
    let bus = bus.clone();
    let mut subscription = bus.subscribe();

    tokio::spawn(async move {
        let name = surface.name().to_string();
        tracing::debug!(surface = %name, subscriber = %subscription.id, "surface attached");

        while let Some(event) = subscription.receiver.recv().await {
            if let Err(e) = surface.receive(&event).await {
                tracing::warn!(surface = %name, error = %e, "surface failed, detaching");
                bus.unsubscribe(subscription.id);
                return;
            }
        }
        tracing::debug!(surface = %name, "surface detached");
    })
}
