//! NATS subscribers feeding the engine.

use autorule_workflow::{CompletionSignal, Engine, TriggerEvent, TriggerPublisher};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

/// Delivers completion signals published on `subject`.
///
/// A message with a reply subject gets the acknowledgement back.
pub async fn completion_listener(client: async_nats::Client, subject: String, engine: Engine) {
    let mut subscriber = match client.subscribe(subject.clone()).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(%subject, error = %e, "failed to subscribe to completion signals");
            return;
        }
    };
    info!(%subject, "listening for completion signals");

    while let Some(message) = subscriber.next().await {
        let signal: CompletionSignal = match serde_json::from_slice(&message.payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "malformed completion signal dropped");
                continue;
            }
        };

        match engine.complete(signal).await {
            Ok(ack) => {
                debug!(?ack, "completion signal handled");
                if let Some(reply) = message.reply {
                    match serde_json::to_vec(&ack) {
                        Ok(bytes) => {
                            if let Err(e) = client.publish(reply, bytes.into()).await {
                                warn!(error = %e, "failed to reply to completion signal");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode completion ack"),
                    }
                }
            }
            Err(report) => warn!(error = %report, "completion signal rejected"),
        }
    }
}

/// Publishes trigger events from `subject` into the engine.
pub async fn event_listener(client: async_nats::Client, subject: String, engine: Engine) {
    let mut subscriber = match client.subscribe(subject.clone()).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(%subject, error = %e, "failed to subscribe to trigger events");
            return;
        }
    };
    info!(%subject, "listening for trigger events");

    while let Some(message) = subscriber.next().await {
        match serde_json::from_slice::<TriggerEvent>(&message.payload) {
            Ok(event) => engine.publish(event).await,
            Err(e) => warn!(error = %e, "malformed trigger event dropped"),
        }
    }
}
