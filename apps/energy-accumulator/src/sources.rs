//! Host-side collaborators: live state, state history, and the in-process registry that
//! provides both when the accumulator runs standalone.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::observation::{Observation, SourceState};

const SUBSCRIBER_CAPACITY: usize = 64;

#[async_trait]
pub trait LiveStateSource: Send + Sync {
    /// Current state of `source_id`, or `None` when the host has never reported it.
    async fn current_state(&self, source_id: &str) -> Option<SourceState>;

    /// Stream of state changes for `source_id`.
    async fn subscribe(&self, source_id: &str) -> broadcast::Receiver<SourceState>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// All valid observations of `source_id` with `start <= timestamp <= end`. When no sample
    /// falls exactly on `start`, the state in effect at `start` leads the result, re-stamped to
    /// `start`.
    async fn query(
        &self,
        source_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;
}

#[derive(Debug)]
struct SourceEntry {
    latest: Option<SourceState>,
    history: VecDeque<Observation>,
    tx: broadcast::Sender<SourceState>,
}

impl SourceEntry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            latest: None,
            history: VecDeque::new(),
            tx,
        }
    }
}

/// Latest state plus a bounded recorder per source.
#[derive(Clone)]
pub struct StateRegistry {
    entries: Arc<RwLock<HashMap<String, SourceEntry>>>,
    retention: ChronoDuration,
    record_history: bool,
}

impl StateRegistry {
    pub fn new(retention: ChronoDuration, record_history: bool) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            retention,
            record_history,
        }
    }

    pub fn records_history(&self) -> bool {
        self.record_history
    }

    /// Stores a reported state and fans it out to subscribers. Returns false when the update is
    /// older than what is already known and was dropped.
    pub async fn publish(&self, state: SourceState) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(state.source_id.clone())
            .or_insert_with(SourceEntry::new);

        if let Some(latest) = &entry.latest {
            if state.updated_at < latest.updated_at {
                tracing::debug!(source_id = %state.source_id, "dropping out-of-order state update");
                return false;
            }
        }

        if self.record_history {
            if let Some(obs) = state.observation() {
                entry.history.push_back(obs);
            }
            let cutoff = state.updated_at - self.retention;
            while entry.history.front().is_some_and(|o| o.timestamp < cutoff) {
                entry.history.pop_front();
            }
        }

        entry.latest = Some(state.clone());
        // No receivers is fine; groups subscribe lazily.
        let _ = entry.tx.send(state);
        true
    }
}

#[async_trait]
impl LiveStateSource for StateRegistry {
    async fn current_state(&self, source_id: &str) -> Option<SourceState> {
        let entries = self.entries.read().await;
        entries.get(source_id).and_then(|e| e.latest.clone())
    }

    async fn subscribe(&self, source_id: &str) -> broadcast::Receiver<SourceState> {
        let mut entries = self.entries.write().await;
        entries
            .entry(source_id.to_string())
            .or_insert_with(SourceEntry::new)
            .tx
            .subscribe()
    }
}

#[async_trait]
impl HistoryStore for StateRegistry {
    async fn query(
        &self,
        source_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(source_id) else {
            return Ok(Vec::new());
        };
        let mut window: Vec<Observation> = entry
            .history
            .iter()
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .copied()
            .collect();
        if window.first().map_or(true, |o| o.timestamp > start) {
            if let Some(prior) = entry.history.iter().rev().find(|o| o.timestamp < start) {
                window.insert(0, Observation::new(prior.value, start));
            }
        }
        Ok(window)
    }
}
