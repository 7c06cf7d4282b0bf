//! Query output model and PostgreSQL value conversion.
//!
//! Every value the driver hands back is mapped into [`CellValue`], a
//! JSON-representable sum over the supported PostgreSQL types, and from
//! there into `serde_json::Value` cells. Integer and NUMERIC precision is
//! preserved end to end: NUMERIC becomes an arbitrary-precision number
//! token rather than a float.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bit_vec::BitVec;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Timelike, Utc};
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::types::PgMoney;
use sqlx::postgres::types::PgRange;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use std::ops::Bound;
use uuid::Uuid;

use crate::{GatewayError, Result};

/// Input for one gateway query call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInput {
    /// A single UTF-8 SQL statement.
    pub sql: String,
}

impl QueryInput {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

/// The result of one gateway query call.
///
/// `rows` is `None` after truncation, in which case `error` carries the
/// bounded JSON prefix and the truncation marker. `error` is empty on
/// success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryOutput {
    /// Ordered column names, unique within the result.
    pub columns: Vec<String>,
    /// One ordered mapping per row, keyed by column name.
    pub rows: Option<Vec<JsonMap<String, JsonValue>>>,
    /// Rows-affected count from the command tag.
    pub rows_affected: i64,
    /// Diagnostic text; empty on success.
    pub error: String,
}

impl QueryOutput {
    /// An output carrying only an error message.
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }
}

/// A single PostgreSQL value in JSON-representable form.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// NULL value
    Null,
    /// BOOLEAN
    Bool(bool),
    /// SMALLINT
    SmallInt(i16),
    /// INTEGER
    Int(i32),
    /// BIGINT
    BigInt(i64),
    /// REAL
    Float(f32),
    /// DOUBLE PRECISION
    Double(f64),
    /// NUMERIC / DECIMAL, canonical decimal form
    Numeric(Decimal),
    /// VARCHAR, TEXT, CHAR, and every type rendered textually
    String(String),
    /// BYTEA and XML, emitted as base64
    Bytes(Vec<u8>),
    /// UUID
    Uuid(Uuid),
    /// DATE
    Date(NaiveDate),
    /// TIME
    Time(NaiveTime),
    /// TIMESTAMP (no timezone; rendered as UTC)
    Timestamp(NaiveDateTime),
    /// TIMESTAMPTZ
    TimestampTz(DateTime<Utc>),
    /// INTERVAL, decomposed the way the wire carries it
    Interval {
        months: i32,
        days: i32,
        microseconds: i64,
    },
    /// JSON / JSONB, already materialized
    Json(JsonValue),
    /// Any array type; multi-dimensional arrays arrive flattened
    Array(Vec<CellValue>),
    /// INET / CIDR
    Inet(IpNetwork),
    /// MACADDR
    Mac(MacAddress),
    /// BIT / VARBIT as a '0'/'1' character string
    Bits(String),
    /// Range types rendered in `[lo,hi)` form
    Range(String),
}

impl CellValue {
    /// Converts into the JSON value shipped to the caller.
    pub fn into_json(self) -> JsonValue {
        match self {
            CellValue::Null => JsonValue::Null,
            CellValue::Bool(v) => JsonValue::Bool(v),
            CellValue::SmallInt(v) => JsonValue::Number(v.into()),
            CellValue::Int(v) => JsonValue::Number(v.into()),
            CellValue::BigInt(v) => JsonValue::Number(v.into()),
            CellValue::Float(v) => float_to_json(v as f64),
            CellValue::Double(v) => float_to_json(v),
            CellValue::Numeric(v) => {
                JsonValue::Number(serde_json::Number::from_string_unchecked(v.to_string()))
            }
            CellValue::String(v) => JsonValue::String(v),
            CellValue::Bytes(v) => JsonValue::String(BASE64.encode(v)),
            CellValue::Uuid(v) => JsonValue::String(v.to_string()),
            CellValue::Date(v) => {
                let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default();
                let ts = DateTime::<Utc>::from_naive_utc_and_offset(v.and_time(midnight), Utc);
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            CellValue::Time(v) => JsonValue::String(format_time(v)),
            CellValue::Timestamp(v) => {
                let ts = DateTime::<Utc>::from_naive_utc_and_offset(v, Utc);
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            CellValue::TimestampTz(v) => {
                JsonValue::String(v.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            CellValue::Interval {
                months,
                days,
                microseconds,
            } => JsonValue::String(format_interval(months, days, microseconds)),
            CellValue::Json(v) => v,
            CellValue::Array(values) => {
                JsonValue::Array(values.into_iter().map(CellValue::into_json).collect())
            }
            CellValue::Inet(v) => JsonValue::String(v.to_string()),
            CellValue::Mac(v) => JsonValue::String(v.to_string().to_lowercase()),
            CellValue::Bits(v) => JsonValue::String(v),
            CellValue::Range(v) => JsonValue::String(v),
        }
    }
}

fn float_to_json(v: f64) -> JsonValue {
    if v.is_nan() {
        JsonValue::String("NaN".to_string())
    } else if v == f64::INFINITY {
        JsonValue::String("Infinity".to_string())
    } else if v == f64::NEG_INFINITY {
        JsonValue::String("-Infinity".to_string())
    } else {
        serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// `HH:MM:SS`, with microseconds appended only when sub-second precision
/// is present.
fn format_time(t: NaiveTime) -> String {
    if t.nanosecond() == 0 {
        t.format("%H:%M:%S").to_string()
    } else {
        t.format("%H:%M:%S%.6f").to_string()
    }
}

/// Renders an interval from its wire components, e.g.
/// `1 year(s) 2 mon(s) 3 day(s) 4h5m6s`. Zero components are omitted;
/// a zero interval renders as `0s`.
pub(crate) fn format_interval(months: i32, days: i32, microseconds: i64) -> String {
    let mut parts = Vec::new();
    let years = months / 12;
    let months = months % 12;
    if years != 0 {
        parts.push(format!("{} year(s)", years));
    }
    if months != 0 {
        parts.push(format!("{} mon(s)", months));
    }
    if days != 0 {
        parts.push(format!("{} day(s)", days));
    }
    if microseconds != 0 || parts.is_empty() {
        parts.push(format_duration(microseconds));
    }
    parts.join(" ")
}

/// Compact `4h5m6s`-style rendering of a microsecond count. Once a unit is
/// printed, smaller units are printed too, so `4h0m6s` stays unambiguous.
fn format_duration(microseconds: i64) -> String {
    if microseconds == 0 {
        return "0s".to_string();
    }
    let negative = microseconds < 0;
    let mut rest = microseconds.unsigned_abs();

    let hours = rest / 3_600_000_000;
    rest %= 3_600_000_000;
    let minutes = rest / 60_000_000;
    rest %= 60_000_000;
    let seconds = rest / 1_000_000;
    let micros = rest % 1_000_000;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if micros == 0 {
        out.push_str(&format!("{}s", seconds));
    } else {
        let frac = format!("{:06}", micros);
        out.push_str(&format!("{}.{}s", seconds, frac.trim_end_matches('0')));
    }
    out
}

/// Extracts every cell of a driver row, in column order.
pub fn row_to_cells(row: &PgRow) -> Result<Vec<(String, CellValue)>> {
    let mut cells = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = extract_cell(row, idx, column.type_info().name(), &name)?;
        cells.push((name, value));
    }
    Ok(cells)
}

/// Converts one driver row into an ordered JSON mapping.
pub fn row_to_json(row: &PgRow) -> Result<JsonMap<String, JsonValue>> {
    let mut map = JsonMap::new();
    for (name, value) in row_to_cells(row)? {
        map.insert(name, value.into_json());
    }
    Ok(map)
}

fn extract_cell(row: &PgRow, idx: usize, type_name: &str, column: &str) -> Result<CellValue> {
    macro_rules! get {
        ($ty:ty, $variant:expr) => {
            match row.try_get::<Option<$ty>, _>(idx) {
                Ok(Some(v)) => Ok($variant(v)),
                Ok(None) => Ok(CellValue::Null),
                Err(e) => Err(GatewayError::Query(format!(
                    "failed to extract {} from column '{}': {}",
                    type_name, column, e
                ))),
            }
        };
    }

    match type_name {
        "BOOL" => get!(bool, CellValue::Bool),
        "INT2" => get!(i16, CellValue::SmallInt),
        "INT4" => get!(i32, CellValue::Int),
        "INT8" => get!(i64, CellValue::BigInt),
        "FLOAT4" => get!(f32, CellValue::Float),
        "FLOAT8" => get!(f64, CellValue::Double),
        "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            get!(String, CellValue::String)
        }
        "BYTEA" => get!(Vec<u8>, CellValue::Bytes),
        "UUID" => get!(Uuid, CellValue::Uuid),
        "DATE" => get!(NaiveDate, CellValue::Date),
        "TIME" => get!(NaiveTime, CellValue::Time),
        "TIMESTAMP" => get!(NaiveDateTime, CellValue::Timestamp),
        "TIMESTAMPTZ" => get!(DateTime<Utc>, CellValue::TimestampTz),
        "JSON" | "JSONB" => get!(JsonValue, CellValue::Json),
        "INET" | "CIDR" => get!(IpNetwork, CellValue::Inet),
        "MACADDR" => get!(MacAddress, CellValue::Mac),
        "INTERVAL" => match row.try_get::<Option<PgInterval>, _>(idx) {
            Ok(Some(v)) => Ok(CellValue::Interval {
                months: v.months,
                days: v.days,
                microseconds: v.microseconds,
            }),
            Ok(None) => Ok(CellValue::Null),
            Err(e) => Err(GatewayError::Query(format!(
                "failed to extract INTERVAL from column '{}': {}",
                column, e
            ))),
        },
        "BIT" | "VARBIT" => match row.try_get::<Option<BitVec>, _>(idx) {
            Ok(Some(v)) => Ok(CellValue::Bits(
                v.iter().map(|b| if b { '1' } else { '0' }).collect(),
            )),
            Ok(None) => Ok(CellValue::Null),
            Err(e) => Err(GatewayError::Query(format!(
                "failed to extract bit string from column '{}': {}",
                column, e
            ))),
        },
        "MONEY" => match row.try_get::<Option<PgMoney>, _>(idx) {
            Ok(Some(v)) => Ok(CellValue::String(v.to_decimal(2).to_string())),
            Ok(None) => Ok(CellValue::Null),
            Err(e) => Err(GatewayError::Query(format!(
                "failed to extract MONEY from column '{}': {}",
                column, e
            ))),
        },
        "NUMERIC" => {
            // Native Decimal first; NaN and the infinities fail that decode
            // and come through the f64 fallback as the special strings.
            if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
                Ok(match v {
                    Some(v) => CellValue::Numeric(v),
                    None => CellValue::Null,
                })
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                Ok(match v {
                    Some(v) => CellValue::Double(v),
                    None => CellValue::Null,
                })
            } else {
                match row.try_get::<Option<String>, _>(idx) {
                    Ok(Some(v)) => Ok(CellValue::String(v)),
                    Ok(None) => Ok(CellValue::Null),
                    Err(e) => Err(GatewayError::Query(format!(
                        "failed to extract NUMERIC from column '{}': {}",
                        column, e
                    ))),
                }
            }
        }
        "XML" => match row.try_get_unchecked::<Option<String>, _>(idx) {
            Ok(Some(v)) => Ok(CellValue::Bytes(v.into_bytes())),
            Ok(None) => Ok(CellValue::Null),
            Err(e) => Err(GatewayError::Query(format!(
                "failed to extract XML from column '{}': {}",
                column, e
            ))),
        },

        "INT4RANGE" => extract_range::<i32>(row, idx, column),
        "INT8RANGE" => extract_range::<i64>(row, idx, column),
        "NUMRANGE" => extract_range::<Decimal>(row, idx, column),
        "DATERANGE" => extract_range::<NaiveDate>(row, idx, column),
        "TSRANGE" => extract_range::<NaiveDateTime>(row, idx, column),
        "TSTZRANGE" => extract_range::<DateTime<Utc>>(row, idx, column),

        "BOOL[]" => extract_array::<bool>(row, idx, column, CellValue::Bool),
        "INT2[]" => extract_array::<i16>(row, idx, column, CellValue::SmallInt),
        "INT4[]" => extract_array::<i32>(row, idx, column, CellValue::Int),
        "INT8[]" => extract_array::<i64>(row, idx, column, CellValue::BigInt),
        "FLOAT4[]" => extract_array::<f32>(row, idx, column, CellValue::Float),
        "FLOAT8[]" => extract_array::<f64>(row, idx, column, CellValue::Double),
        "NUMERIC[]" => extract_array::<Decimal>(row, idx, column, CellValue::Numeric),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => {
            extract_array::<String>(row, idx, column, CellValue::String)
        }
        "UUID[]" => extract_array::<Uuid>(row, idx, column, CellValue::Uuid),
        "DATE[]" => extract_array::<NaiveDate>(row, idx, column, CellValue::Date),
        "TIMESTAMP[]" => extract_array::<NaiveDateTime>(row, idx, column, CellValue::Timestamp),
        "TIMESTAMPTZ[]" => {
            extract_array::<DateTime<Utc>>(row, idx, column, CellValue::TimestampTz)
        }
        "JSONB[]" | "JSON[]" => extract_array::<JsonValue>(row, idx, column, CellValue::Json),

        // Everything else PostgreSQL renders textually: enums, composites,
        // text search, geometric types, and unknown extensions.
        unknown => {
            tracing::debug!(
                r#type = unknown,
                column = column,
                "no native mapping, extracting as text"
            );
            match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(Some(v)) => Ok(CellValue::String(v)),
                Ok(None) => Ok(CellValue::Null),
                Err(e) => Err(GatewayError::Query(format!(
                    "failed to extract type '{}' from column '{}': {}",
                    unknown, column, e
                ))),
            }
        }
    }
}

fn extract_array<T>(
    row: &PgRow,
    idx: usize,
    column: &str,
    convert: impl Fn(T) -> CellValue,
) -> Result<CellValue>
where
    for<'a> Vec<Option<T>>: sqlx::Decode<'a, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    match row.try_get::<Option<Vec<Option<T>>>, _>(idx) {
        Ok(Some(items)) => Ok(CellValue::Array(
            items
                .into_iter()
                .map(|item| item.map(&convert).unwrap_or(CellValue::Null))
                .collect(),
        )),
        Ok(None) => Ok(CellValue::Null),
        Err(e) => Err(GatewayError::Query(format!(
            "failed to extract array from column '{}': {}",
            column, e
        ))),
    }
}

fn extract_range<T>(row: &PgRow, idx: usize, column: &str) -> Result<CellValue>
where
    T: std::fmt::Display + PartialEq,
    for<'a> PgRange<T>: sqlx::Decode<'a, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    match row.try_get::<Option<PgRange<T>>, _>(idx) {
        Ok(Some(range)) => Ok(CellValue::Range(format_range(range))),
        Ok(None) => Ok(CellValue::Null),
        Err(e) => Err(GatewayError::Query(format!(
            "failed to extract range from column '{}': {}",
            column, e
        ))),
    }
}

fn format_range<T: std::fmt::Display + PartialEq>(range: PgRange<T>) -> String {
    // An empty range comes back with two excluded, equal bounds.
    if let (Bound::Excluded(lo), Bound::Excluded(hi)) = (&range.start, &range.end) {
        if lo == hi {
            return "empty".to_string();
        }
    }
    let (open, lo) = match &range.start {
        Bound::Included(v) => ('[', v.to_string()),
        Bound::Excluded(v) => ('(', v.to_string()),
        Bound::Unbounded => ('[', String::new()),
    };
    let (close, hi) = match &range.end {
        Bound::Included(v) => (']', v.to_string()),
        Bound::Excluded(v) => (')', v.to_string()),
        Bound::Unbounded => (')', String::new()),
    };
    format!("{}{},{}{}", open, lo, hi, close)
}
