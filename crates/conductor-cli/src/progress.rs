//! Publishes workflow engine events on the message bus.
//!
//! Each [`WorkflowEvent`] becomes a broadcast on `workflow.<event>` (for
//! example `workflow.taskComplete`) from the `workflow-engine` sender.

use conductor_bus::{MessageBus, SendOptions};
use conductor_workflow::{WorkflowEngine, WorkflowEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

/// Sender id used for forwarded events.
pub const ENGINE_AGENT_ID: &str = "workflow-engine";

/// Bus topic an event is published on.
pub fn event_topic(event: &WorkflowEvent) -> String {
    event.name().replace(':', ".")
}

/// Forward engine events to `bus` until every engine handle is dropped.
pub fn forward_events(engine: &WorkflowEngine, bus: MessageBus) -> JoinHandle<()> {
    let mut events = engine.events();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} workflow events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let payload = match serde_json::to_value(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Cannot encode {} event: {}", event.name(), e);
                    continue;
                }
            };

            if let Err(e) = bus
                .publish(ENGINE_AGENT_ID, event_topic(&event), payload, SendOptions::new())
                .await
            {
                warn!("Failed to publish {}: {}", event.name(), e);
            }
        }
    })
}
