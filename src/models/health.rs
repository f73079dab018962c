// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Health sample models: the per-user sync state row, the append-only
//! record rows, and the raw upload shape with its normalization rules.

use crate::time_utils::{format_utc_rfc3339, parse_rfc3339_utc};
use serde::{Deserialize, Serialize};

/// Per-user sync coordination row.
///
/// `pending = true` means a sync was requested and no ingestion has
/// satisfied it since. Only a successful ingestion clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub pending: bool,
    /// When the last successful ingestion ran (ISO 8601)
    pub last_synced_at: Option<String>,
    /// Raw provider payload from the last import, if any
    pub raw_snapshot: Option<String>,
    pub updated_at: String,
}

impl SyncState {
    /// State for a user that has never requested or completed a sync.
    pub fn initial(now: &str) -> Self {
        Self {
            pending: false,
            last_synced_at: None,
            raw_snapshot: None,
            updated_at: now.to_string(),
        }
    }
}

/// Enumerated health sample types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    StepCount,
    HeartRate,
    Value,
    Duration,
    BloodPressure,
}

impl RecordKind {
    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::StepCount => "step-count",
            RecordKind::HeartRate => "heart-rate",
            RecordKind::Value => "value",
            RecordKind::Duration => "duration",
            RecordKind::BloodPressure => "blood-pressure",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "step-count" => Some(RecordKind::StepCount),
            "heart-rate" => Some(RecordKind::HeartRate),
            "value" => Some(RecordKind::Value),
            "duration" => Some(RecordKind::Duration),
            "blood-pressure" => Some(RecordKind::BloodPressure),
            _ => None,
        }
    }
}

/// A single immutable health sample.
///
/// Only the numeric fields relevant to `kind` are populated; the rest stay
/// null. Rows are append-only and keyed by (user, kind, recorded_at).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub user_id: String,
    pub kind: RecordKind,
    pub count: Option<f64>,
    pub bpm: Option<f64>,
    pub value: Option<f64>,
    pub duration: Option<f64>,
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    /// Sample timestamp (ISO 8601, normalized to UTC)
    pub recorded_at: String,
    pub created_at: String,
}

impl HealthRecord {
    /// Document id for this record.
    ///
    /// Deterministic in (user, kind, recorded_at), so a retried upload
    /// overwrites its earlier self instead of duplicating the sample.
    pub fn doc_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.user_id,
            self.kind.as_str(),
            urlencoding::encode(&self.recorded_at)
        )
    }
}

/// A raw uploaded sample, before validation.
///
/// Numeric fields arrive as arbitrary JSON (mobile clients send both
/// numbers and numeric strings) and are coerced during normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSample {
    #[serde(rename = "type")]
    pub kind: String,
    pub date: String,
    #[serde(default)]
    pub count: Option<serde_json::Value>,
    #[serde(default)]
    pub bpm: Option<serde_json::Value>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub duration: Option<serde_json::Value>,
    #[serde(default)]
    pub systolic: Option<serde_json::Value>,
    #[serde(default)]
    pub diastolic: Option<serde_json::Value>,
}

/// Why a sample (and therefore its whole batch) was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("unknown sample type: {0}")]
    UnknownKind(String),
    #[error("unparseable sample date: {0}")]
    BadDate(String),
}

impl RawSample {
    /// Validate and normalize this sample into a storable record.
    ///
    /// Unknown types and unparseable dates are errors; numeric fields are
    /// coerced when present and left null when absent or non-numeric. Only
    /// the fields relevant to the declared kind are carried over.
    pub fn normalize(&self, user_id: &str, now: &str) -> Result<HealthRecord, SampleError> {
        let kind = RecordKind::parse(&self.kind)
            .ok_or_else(|| SampleError::UnknownKind(self.kind.clone()))?;

        let recorded_at = parse_rfc3339_utc(&self.date)
            .map(format_utc_rfc3339)
            .ok_or_else(|| SampleError::BadDate(self.date.clone()))?;

        let mut record = HealthRecord {
            user_id: user_id.to_string(),
            kind,
            count: None,
            bpm: None,
            value: None,
            duration: None,
            systolic: None,
            diastolic: None,
            recorded_at,
            created_at: now.to_string(),
        };

        match kind {
            RecordKind::StepCount => record.count = coerce_numeric(self.count.as_ref()),
            RecordKind::HeartRate => record.bpm = coerce_numeric(self.bpm.as_ref()),
            RecordKind::Value => record.value = coerce_numeric(self.value.as_ref()),
            RecordKind::Duration => record.duration = coerce_numeric(self.duration.as_ref()),
            RecordKind::BloodPressure => {
                record.systolic = coerce_numeric(self.systolic.as_ref());
                record.diastolic = coerce_numeric(self.diastolic.as_ref());
            }
        }

        Ok(record)
    }
}

/// Coerce a JSON value to a number: numbers pass through, numeric strings
/// parse, anything else becomes null.
fn coerce_numeric(raw: Option<&serde_json::Value>) -> Option<f64> {
    match raw? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(kind: &str, date: &str) -> RawSample {
        RawSample {
            kind: kind.to_string(),
            date: date.to_string(),
            count: None,
            bpm: None,
            value: None,
            duration: None,
            systolic: None,
            diastolic: None,
        }
    }

    #[test]
    fn normalize_heart_rate_from_number_and_string() {
        let mut s = sample("heart-rate", "2024-01-01T00:00:00Z");
        s.bpm = Some(json!(72));
        let rec = s.normalize("u1", "2024-01-02T00:00:00Z").unwrap();
        assert_eq!(rec.kind, RecordKind::HeartRate);
        assert_eq!(rec.bpm, Some(72.0));
        assert_eq!(rec.count, None);

        s.bpm = Some(json!("68.5"));
        let rec = s.normalize("u1", "2024-01-02T00:00:00Z").unwrap();
        assert_eq!(rec.bpm, Some(68.5));
    }

    #[test]
    fn non_numeric_payload_becomes_null() {
        let mut s = sample("step-count", "2024-01-01T00:00:00Z");
        s.count = Some(json!("lots"));
        let rec = s.normalize("u1", "2024-01-02T00:00:00Z").unwrap();
        assert_eq!(rec.count, None);
    }

    #[test]
    fn irrelevant_fields_are_dropped() {
        let mut s = sample("blood-pressure", "2024-01-01T00:00:00Z");
        s.systolic = Some(json!(120));
        s.diastolic = Some(json!(80));
        s.bpm = Some(json!(99)); // not a blood-pressure field
        let rec = s.normalize("u1", "2024-01-02T00:00:00Z").unwrap();
        assert_eq!(rec.systolic, Some(120.0));
        assert_eq!(rec.diastolic, Some(80.0));
        assert_eq!(rec.bpm, None);
    }

    #[test]
    fn unknown_kind_rejected() {
        let s = sample("mood", "2024-01-01T00:00:00Z");
        assert!(matches!(
            s.normalize("u1", "now"),
            Err(SampleError::UnknownKind(_))
        ));
    }

    #[test]
    fn bad_date_rejected() {
        let s = sample("heart-rate", "not-a-date");
        assert!(matches!(
            s.normalize("u1", "now"),
            Err(SampleError::BadDate(_))
        ));
    }

    #[test]
    fn doc_id_is_stable_for_same_identity() {
        let mut s = sample("heart-rate", "2024-01-01T08:00:00+08:00");
        s.bpm = Some(json!(70));
        let a = s.normalize("u1", "t0").unwrap();
        let b = s.normalize("u1", "t1").unwrap();
        // Same (user, type, date) identity regardless of upload time
        assert_eq!(a.doc_id(), b.doc_id());
        // Offset timestamps normalize to UTC before keying
        assert_eq!(a.recorded_at, "2024-01-01T00:00:00Z");
    }
}
