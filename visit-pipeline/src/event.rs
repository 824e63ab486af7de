use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedRecordError;

/// What the visitor was doing when the visit was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LastAction {
    Catalog,
    #[serde(rename = "FAQ")]
    Faq,
    Order,
    ShoppingCart,
}

impl LastAction {
    pub const ALL: [LastAction; 4] = [
        LastAction::Catalog,
        LastAction::Faq,
        LastAction::Order,
        LastAction::ShoppingCart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LastAction::Catalog => "Catalog",
            LastAction::Faq => "FAQ",
            LastAction::Order => "Order",
            LastAction::ShoppingCart => "ShoppingCart",
        }
    }
}

impl fmt::Display for LastAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive, so producers writing `shoppingcart` or `faq` are accepted.
impl FromStr for LastAction {
    type Err = MalformedRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LastAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MalformedRecordError::UnknownAction(s.to_owned()))
    }
}

/// A single website visit, as read from the source topic and republished unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitEvent {
    pub country: String,
    pub last_action: LastAction,
    pub visit_date: DateTime<Utc>,
    /// Seconds spent on the site
    pub duration: u32,
}

impl VisitEvent {
    /// Event time used for watermarking, in milliseconds since the epoch.
    pub fn event_time_ms(&self) -> i64 {
        self.visit_date.timestamp_millis()
    }

    /// Partition key for republished records, keeps per-country ordering.
    pub fn key(&self) -> &str {
        &self.country
    }
}

/// A validated event along with its position in the source.
///
/// `payload` is the record exactly as read, republished untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub event: VisitEvent,
    pub payload: Arc<str>,
}

impl SourceRecord {
    /// A record whose payload is the event's own serialization.
    pub fn from_event(
        partition: i32,
        offset: i64,
        event: VisitEvent,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(&event)?;
        Ok(Self {
            partition,
            offset,
            event,
            payload: payload.into(),
        })
    }
}

/// What the source hands over before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// One unit of work broadcast to every sink.
///
/// `next_offsets` covers every raw record pulled for this batch, malformed ones
/// included, so sinks move past records that were dropped during normalization.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<SourceRecord>,
    pub next_offsets: BTreeMap<i32, i64>,
}
