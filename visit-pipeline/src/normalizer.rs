use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::MalformedRecordError;
use crate::event::{LastAction, RawRecord, RecordBatch, SourceRecord, VisitEvent};
use crate::metrics_consts::{MALFORMED_RECORDS, RECORDS_RECEIVED};

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Loose view of a record, so missing fields are reported by name instead of
/// as a generic parse error.
#[derive(Deserialize)]
struct WireVisit {
    country: Option<String>,
    last_action: Option<String>,
    visit_date: Option<Value>,
    duration: Option<i64>,
}

/// Validates raw source records into `VisitEvent`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(
        &self,
        partition: i32,
        offset: i64,
        payload: Option<&[u8]>,
    ) -> Result<SourceRecord, MalformedRecordError> {
        let payload = match payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(MalformedRecordError::EmptyPayload),
        };
        let payload = std::str::from_utf8(payload)?;
        let wire: WireVisit = serde_json::from_str(payload)?;

        let country = wire
            .country
            .map(|country| country.trim().to_owned())
            .filter(|country| !country.is_empty())
            .ok_or(MalformedRecordError::MissingField("country"))?;
        let last_action = wire
            .last_action
            .ok_or(MalformedRecordError::MissingField("last_action"))?
            .parse::<LastAction>()?;
        let visit_date = parse_visit_date(
            wire.visit_date
                .ok_or(MalformedRecordError::MissingField("visit_date"))?,
        )?;
        let duration = wire
            .duration
            .ok_or(MalformedRecordError::MissingField("duration"))?;
        let duration =
            u32::try_from(duration).map_err(|_| MalformedRecordError::InvalidDuration(duration))?;

        Ok(SourceRecord {
            partition,
            offset,
            event: VisitEvent {
                country,
                last_action,
                visit_date,
                duration,
            },
            payload: payload.into(),
        })
    }

    /// Normalizes a pulled batch. Malformed records are logged, counted and
    /// dropped, but their offsets still count as consumed.
    pub fn normalize_batch(&self, raw: Vec<RawRecord>) -> RecordBatch {
        let mut batch = RecordBatch {
            records: Vec::with_capacity(raw.len()),
            ..Default::default()
        };
        counter!(RECORDS_RECEIVED).increment(raw.len() as u64);

        for record in raw {
            let next = batch.next_offsets.entry(record.partition).or_insert(0);
            *next = (*next).max(record.offset + 1);

            match self.normalize(record.partition, record.offset, record.payload.as_deref()) {
                Ok(normalized) => batch.records.push(normalized),
                Err(e) => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        "dropping malformed record: {e}"
                    );
                    counter!(MALFORMED_RECORDS, "reason" => e.reason()).increment(1);
                }
            }
        }
        batch
    }
}

fn parse_visit_date(raw: Value) -> Result<DateTime<Utc>, MalformedRecordError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| MalformedRecordError::InvalidTimestamp(n.to_string())),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
                .map(|naive| naive.and_utc())
                .ok_or(MalformedRecordError::InvalidTimestamp(s))
        }
        other => Err(MalformedRecordError::InvalidTimestamp(other.to_string())),
    }
}
