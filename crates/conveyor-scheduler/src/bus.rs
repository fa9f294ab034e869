//! In-process event bus implementations.

use async_trait::async_trait;
use conveyor_core::events::Event;
use conveyor_core::ports::EventBus;
use conveyor_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Writes every event to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingEventBus;

impl TracingEventBus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        match &event {
            Event::RunStarted(p) => {
                info!(%subject, pipeline = %p.pipeline_name, jobs = p.job_count, "event")
            }
            Event::RunCancelled(p) => warn!(%subject, reason = %p.reason, "event"),
            Event::RunCompleted(p) => {
                info!(%subject, verdict = %p.verdict, duration_ms = p.duration_ms, "event")
            }
            _ => debug!(%subject, "event"),
        }
        Ok(())
    }
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| Error::EventBus(format!("Failed to broadcast event: {}", e)))
    }
}

/// Publishes each event to several buses in order.
pub struct FanoutEventBus {
    buses: Vec<Arc<dyn EventBus>>,
}

impl FanoutEventBus {
    pub fn new(buses: Vec<Arc<dyn EventBus>>) -> Self {
        Self { buses }
    }
}

#[async_trait]
impl EventBus for FanoutEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let mut first_error = None;
        for bus in &self.buses {
            if let Err(e) = bus.publish(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
