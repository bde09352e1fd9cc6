//! Durable accumulator state: one JSON document mapping accumulator keys to records.
//!
//! Every save is a full read-modify-write of the document. The cycle runs under a store-wide
//! lock so two accumulators persisting at the same time cannot drop each other's entries.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::units::ConversionFactor;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}; refusing to overwrite it: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode storage document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted shape of one accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorRecord {
    #[serde(default)]
    pub value: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub last_power: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_reset: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub last_energy: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub conversion_factor: Option<ConversionFactor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_unit: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_calculation: Option<DateTime<Utc>>,
}

impl AccumulatorRecord {
    /// Older releases stored the bare kWh total instead of a record.
    pub fn from_legacy(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    fn decode(raw: JsonValue) -> Option<Self> {
        match raw {
            JsonValue::Number(n) => n.as_f64().map(Self::from_legacy),
            other @ JsonValue::Object(_) => serde_json::from_value(other).ok(),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AccumulatorStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl AccumulatorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record stored under `key`, or `None` if the key has never been saved.
    pub async fn load(&self, key: &str) -> Option<AccumulatorRecord> {
        let _guard = self.lock.lock().await;
        let mut document = read_document(&self.path).await;
        let raw = document.remove(key)?;
        let decoded = AccumulatorRecord::decode(raw);
        if decoded.is_none() {
            tracing::warn!(key, path = %self.path.display(), "stored accumulator entry is unreadable; starting from zero");
        }
        decoded
    }

    /// Replaces only `key`'s entry in the document. A document that exists but cannot be read
    /// is left untouched.
    pub async fn save(&self, key: &str, record: &AccumulatorRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_value(record)?;
        let _guard = self.lock.lock().await;
        let raw = read_raw(&self.path).await.map_err(|source| StoreError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut document = raw
            .map(|raw| decode_document(&self.path, &raw))
            .unwrap_or_default();
        document.insert(key.to_string(), encoded);
        write_document(&self.path, &document).await
    }

    /// Raw entries as stored, for diagnostics.
    pub async fn entries(&self) -> BTreeMap<String, JsonValue> {
        let _guard = self.lock.lock().await;
        read_document(&self.path).await.into_iter().collect()
    }
}

/// Document text, or `None` when no document has been written yet.
async fn read_raw(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn read_document(path: &Path) -> Map<String, JsonValue> {
    match read_raw(path).await {
        Ok(Some(raw)) => decode_document(path, &raw),
        Ok(None) => Map::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read accumulator storage; treating as empty");
            Map::new()
        }
    }
}

fn decode_document(path: &Path, raw: &str) -> Map<String, JsonValue> {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "accumulator storage is corrupt; treating as empty");
            Map::new()
        }
    }
}

async fn write_document(path: &Path, document: &Map<String, JsonValue>) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(document)?;
    let write_err = |source: std::io::Error| StoreError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}

/// Accepts anything; values that do not decode as `T` become `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as UTC (older documents wrote those).
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    let Some(JsonValue::String(raw)) = raw else {
        return Ok(None);
    };
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}
