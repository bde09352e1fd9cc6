use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, SubscribeFilter};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::observation::SourceState;
use crate::sources::StateRegistry;

const SOURCE_PREFIX: &str = "sensor.";
const STATE_SUFFIX: &str = "state";
const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Deserialize)]
struct StatePayload {
    state: serde_json::Value,
    #[serde(default)]
    unit_of_measurement: Option<String>,
    #[serde(default)]
    device_class: Option<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

fn object_id(source_id: &str) -> &str {
    source_id.strip_prefix(SOURCE_PREFIX).unwrap_or(source_id)
}

pub fn state_topic(prefix: &str, source_id: &str) -> String {
    format!("{prefix}/{}/{STATE_SUFFIX}", object_id(source_id))
}

/// Decodes `{prefix}/{object_id}/state`. The payload is either a JSON object carrying the
/// state and its attributes or a bare state string.
pub fn parse_state_message(
    prefix: &str,
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Option<SourceState> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let object_id = rest.strip_suffix(STATE_SUFFIX)?.strip_suffix('/')?;
    if object_id.is_empty() || object_id.contains('/') {
        return None;
    }
    let source_id = format!("{SOURCE_PREFIX}{object_id}");

    let text = std::str::from_utf8(payload).ok()?.trim();
    if let Ok(parsed) = serde_json::from_str::<StatePayload>(text) {
        let state = match parsed.state {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Some(SourceState {
            source_id,
            state,
            unit: parsed.unit_of_measurement,
            device_class: parsed.device_class,
            updated_at: parsed.last_updated.unwrap_or(received_at),
        });
    }
    Some(SourceState {
        source_id,
        state: text.to_string(),
        unit: None,
        device_class: None,
        updated_at: received_at,
    })
}

/// One subscription per selected source, sent as a single request.
pub fn subscribe_filters(prefix: &str, sources: &[String]) -> Vec<SubscribeFilter> {
    sources
        .iter()
        .map(|source_id| SubscribeFilter::new(state_topic(prefix, source_id), QoS::AtLeastOnce))
        .collect()
}

/// Feeds state messages for `sources` into `registry` until cancelled, reconnecting on error.
pub async fn run_listener(
    config: MqttConfig,
    registry: StateRegistry,
    sources: Vec<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let filters = subscribe_filters(&config.topic_prefix, &sources);
    if filters.is_empty() {
        tracing::info!("no power sensors selected; MQTT state listener idle");
        return Ok(());
    }

    while !cancel.is_cancelled() {
        let mut mqttoptions =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(15));
        if let Some(username) = &config.username {
            mqttoptions.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = client.subscribe_many(filters.clone()) => result,
        };
        if let Err(err) = subscribed {
            tracing::warn!(error = %err, "failed to subscribe to state topics; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(Duration::from_secs(2)) => {}
            }
            continue;
        }
        tracing::info!(host = %config.host, topics = filters.len(), "MQTT state listener subscribed");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    match parse_state_message(
                        &config.topic_prefix,
                        &publish.topic,
                        &publish.payload,
                        Utc::now(),
                    ) {
                        Some(state) => {
                            registry.publish(state).await;
                        }
                        None => {
                            tracing::debug!(topic = %publish.topic, "ignoring message on unexpected topic")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }
    Ok(())
}
