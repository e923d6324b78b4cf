//! Indicator source adapters: endpoint fetch + payload normalization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use xrate_core::{
    coerce_item_id, coerce_percent, sanitize_text_field, sanitize_textarea_field, IndicatorRecord,
};
use xrate_storage::{sha256_hex, FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "xrate-adapters";

pub const TGJU_SOURCE_ID: &str = "tgju";
pub const TGJU_WIDGET_URL: &str = "https://api.tgju.org/v1/widget/tmp";
pub const TGJU_DEFAULT_KEYS: [i64; 10] = [
    523875, 523874, 523877, 523876, 137121, 137138, 137137, 137139, 137140, 137141,
];

/// JSON pointer to the entry list inside a widget payload.
pub const INDICATORS_POINTER: &str = "/response/indicators";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("payload from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub sha256: String,
    pub body: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAnObject,
    InvalidItemId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedBatch {
    pub records: Vec<IndicatorRecord>,
    pub skipped: Vec<SkippedEntry>,
}

impl ParsedBatch {
    pub fn seen(&self) -> usize {
        self.records.len() + self.skipped.len()
    }
}

#[async_trait]
pub trait IndicatorSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn request_url(&self) -> String;

    /// One GET of [`Self::request_url`]; the body must decode as JSON.
    async fn fetch_payload(
        &self,
        http: &HttpFetcher,
        pass_id: Uuid,
    ) -> Result<FetchedPayload, AdapterError> {
        let url = self.request_url();
        let resp = http.fetch_bytes(pass_id, self.source_id(), &url).await?;
        let body = serde_json::from_slice(&resp.body).map_err(|source| AdapterError::Decode {
            url: resp.final_url.clone(),
            source,
        })?;
        Ok(FetchedPayload {
            url: resp.final_url,
            fetched_at: resp.fetched_at,
            sha256: sha256_hex(&resp.body),
            body,
        })
    }

    /// Pure normalization of a decoded payload.
    fn parse_payload(&self, payload: &JsonValue) -> ParsedBatch;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgjuWidgetSource {
    source_id: String,
    base_url: String,
    keys: Vec<i64>,
}

impl TgjuWidgetSource {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>, keys: Vec<i64>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            keys,
        }
    }

    pub fn keys(&self) -> &[i64] {
        &self.keys
    }
}

pub fn tgju_widget_source() -> TgjuWidgetSource {
    TgjuWidgetSource::new(TGJU_SOURCE_ID, TGJU_WIDGET_URL, TGJU_DEFAULT_KEYS.to_vec())
}

#[async_trait]
impl IndicatorSource for TgjuWidgetSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn request_url(&self) -> String {
        if self.keys.is_empty() {
            return self.base_url.clone();
        }
        let keys = self
            .keys
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let sep = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}keys={keys}", self.base_url)
    }

    fn parse_payload(&self, payload: &JsonValue) -> ParsedBatch {
        parse_indicator_payload(payload)
    }
}

/// Keys that every entry is expected to carry. A missing one is logged and left empty.
const REQUIRED_TEXT_KEYS: [&str; 8] = ["name", "title", "p", "h", "l", "o", "d", "updated_at"];

/// Maps `response.indicators` onto records. A payload without that list is an empty batch.
pub fn parse_indicator_payload(payload: &JsonValue) -> ParsedBatch {
    let Some(entries) = payload.pointer(INDICATORS_POINTER).and_then(JsonValue::as_array) else {
        debug!("payload has no {INDICATORS_POINTER} list; nothing to apply");
        return ParsedBatch::default();
    };

    let mut batch = ParsedBatch::default();
    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(entry) {
            Ok(record) => batch.records.push(record),
            Err(reason) => {
                warn!(
                    index,
                    ?reason,
                    item_id = ?entry.get("item_id"),
                    "skipping indicator entry"
                );
                batch.skipped.push(SkippedEntry { index, reason });
            }
        }
    }
    batch
}

fn parse_entry(entry: &JsonValue) -> Result<IndicatorRecord, SkipReason> {
    let Some(fields) = entry.as_object() else {
        return Err(SkipReason::NotAnObject);
    };
    let item_id = fields
        .get("item_id")
        .and_then(coerce_item_id)
        .ok_or(SkipReason::InvalidItemId)?;

    for key in REQUIRED_TEXT_KEYS {
        if json_text(fields.get(key)).is_none() {
            warn!(item_id, key, "indicator entry is missing a field; storing it empty");
        }
    }

    let text = |key: &str| {
        json_text(fields.get(key))
            .map(|v| sanitize_text_field(&v))
            .unwrap_or_default()
    };

    Ok(IndicatorRecord {
        item_id,
        name: text("name"),
        title: text("title"),
        price: text("p"),
        high_price: text("h"),
        low_price: text("l"),
        open_price: text("o"),
        change_value: text("d"),
        change_percent: coerce_percent(fields.get("dp")),
        updated_at: text("updated_at"),
        dt: text("dt"),
        t: text("t"),
        prices: json_text(fields.get("prices"))
            .map(|v| sanitize_textarea_field(&v))
            .unwrap_or_default(),
    })
}

/// Text view of a payload value; `null` and absence are the same thing.
fn json_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other @ (JsonValue::Array(_) | JsonValue::Object(_)) => Some(other.to_string()),
    }
}
