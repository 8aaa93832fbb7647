//! Typed column values.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single typed column value.
///
/// `Cell` is the unit of data flowing through generic table rows. The supported
/// variants cover the scalar types the SQL clients in this crate can read and write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    #[serde(with = "interval_micros")]
    Interval(Duration),
    Uuid(Uuid),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Cell {
    /// Renders the cell as canonical SQL-friendly text.
    ///
    /// This is the representation used to build record identities and generated SQL,
    /// so it must be stable across runs: timestamps use a fixed-precision round-trip
    /// format, intervals a canonical `[-][d.]hh:mm:ss[.ffffff]` form, and nulls render
    /// as the literal text `null`.
    pub fn to_sql_text(&self) -> String {
        match self {
            Cell::Null => "null".to_owned(),
            Cell::Bool(value) => value.to_string(),
            Cell::I16(value) => value.to_string(),
            Cell::I32(value) => value.to_string(),
            Cell::I64(value) => value.to_string(),
            Cell::F32(value) => value.to_string(),
            Cell::F64(value) => value.to_string(),
            Cell::String(value) => value.clone(),
            Cell::Date(value) => value.format("%Y-%m-%d").to_string(),
            Cell::Time(value) => value.format("%H:%M:%S%.6f").to_string(),
            Cell::Timestamp(value) => value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            Cell::TimestampTz(value) => value.to_rfc3339_opts(SecondsFormat::Micros, true),
            Cell::Interval(value) => format_interval(value),
            Cell::Uuid(value) => value.to_string(),
            Cell::Json(value) => value.to_string(),
            Cell::Bytes(value) => to_hex(value),
        }
    }

    /// Returns true if the cell holds no value.
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

// Manual Hash implementation since floats and JSON values don't hash natively.
// Floats hash by bit pattern, JSON by rendered text, matching Cell's PartialEq.
impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);

        match self {
            Cell::Null => {}
            Cell::Bool(value) => value.hash(state),
            Cell::I16(value) => value.hash(state),
            Cell::I32(value) => value.hash(state),
            Cell::I64(value) => value.hash(state),
            Cell::F32(value) => value.to_bits().hash(state),
            Cell::F64(value) => value.to_bits().hash(state),
            Cell::String(value) => value.hash(state),
            Cell::Date(value) => value.hash(state),
            Cell::Time(value) => value.hash(state),
            Cell::Timestamp(value) => value.hash(state),
            Cell::TimestampTz(value) => value.hash(state),
            Cell::Interval(value) => value.num_microseconds().hash(state),
            Cell::Uuid(value) => value.hash(state),
            Cell::Json(value) => value.to_string().hash(state),
            Cell::Bytes(value) => value.hash(state),
        }
    }
}

/// Formats a duration as `[-][d.]hh:mm:ss[.ffffff]`.
fn format_interval(duration: &Duration) -> String {
    let micros = duration.num_microseconds().unwrap_or(i64::MAX);
    let negative = micros < 0;
    let micros = micros.unsigned_abs();

    let total_secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if days > 0 {
        out.push_str(&format!("{days}."));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if frac > 0 {
        out.push_str(&format!(".{frac:06}"));
    }

    out
}

/// Lowercase hex rendering of a byte slice.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

mod interval_micros {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_microseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        Ok(Duration::microseconds(micros))
    }
}
