//! Row decoding.
//!
//! Decoding is a two-phase process:
//! 1. `TypeCategory` classifies the column type reported by the driver
//! 2. a backend-specific decoder extracts the value as JSON
//!
//! How values are shaped (exact vs. floating numerics, binary rendering) is
//! decided by a [`RowDecoder`] passed explicitly into every execution, so no
//! global driver state is involved.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, TypeInfo};

use crate::models::{DatabaseType, Row};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    /// PostgreSQL arrays
    Array,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }

    // Checked first since "numeric" overlaps with the float names
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores plain numbers
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if matches!(
        lower.as_str(),
        "timestamp" | "timestamptz" | "datetime" | "date" | "time" | "timetz"
    ) {
        return TypeCategory::Temporal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decoder Settings
// =============================================================================

/// How DECIMAL/NUMERIC columns are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum NumericMode {
    /// Convert to a JSON number (may lose precision).
    #[default]
    Float,
    /// Keep the exact decimal representation as a string.
    Text,
}

/// Value-shaping rules applied to every decoded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowDecoder {
    numeric: NumericMode,
    decode_binary: bool,
}

impl RowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numeric(mut self, numeric: NumericMode) -> Self {
        self.numeric = numeric;
        self
    }

    /// Render binary columns as UTF-8 text when they contain valid UTF-8.
    pub fn with_decode_binary(mut self, decode_binary: bool) -> Self {
        self.decode_binary = decode_binary;
        self
    }

    pub fn numeric(&self) -> NumericMode {
        self.numeric
    }

    pub fn decode_binary(&self) -> bool {
        self.decode_binary
    }

    pub fn decimal(&self, value: Decimal) -> JsonValue {
        match self.numeric {
            NumericMode::Text => JsonValue::String(value.to_string()),
            NumericMode::Float => match value.to_f64() {
                Some(f) => self.float(f),
                None => JsonValue::String(value.to_string()),
            },
        }
    }

    pub fn float(&self, value: f64) -> JsonValue {
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(value.to_string()))
    }

    pub fn binary(&self, bytes: &[u8]) -> JsonValue {
        decode_binary_value(bytes, self.decode_binary)
    }
}

/// Decode binary data to JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    if decode_binary && let Ok(s) = std::str::from_utf8(bytes) {
        return JsonValue::String(s.to_string());
    }
    JsonValue::String(STANDARD.encode(bytes))
}

/// Trait for converting driver rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self, decoder: &RowDecoder) -> Row;
}

/// Decode every column of `row` through `decode(idx, type_name, category)`.
fn collect_columns<R: sqlx::Row>(
    row: &R,
    db: DatabaseType,
    decode: impl Fn(usize, &str, TypeCategory) -> JsonValue,
) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            let type_name = col.type_info().name();
            let value = decode(col.ordinal(), type_name, categorize_type(type_name, db));
            (col.name().to_string(), value)
        })
        .collect()
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self, decoder: &RowDecoder) -> Row {
        collect_columns(self, DatabaseType::MySQL, |idx, _, category| {
            mysql::decode_column(self, idx, category, decoder)
        })
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self, decoder: &RowDecoder) -> Row {
        collect_columns(self, DatabaseType::PostgreSQL, |idx, _, category| {
            postgres::decode_column(self, idx, category, decoder)
        })
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self, decoder: &RowDecoder) -> Row {
        collect_columns(self, DatabaseType::SQLite, |idx, type_name, category| {
            sqlite::decode_column(self, idx, type_name, category, decoder)
        })
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

/// Try each Rust type in order; the first one the driver accepts decides the
/// value. SQL NULL becomes `null`.
macro_rules! first_decodable {
    ($row:expr, $idx:expr; $($ty:ty => $to_json:expr),+ $(,)?) => {{
        Option::<JsonValue>::None
            $(.or_else(|| {
                sqlx::Row::try_get::<Option<$ty>, _>($row, $idx)
                    .ok()
                    .map(|value| value.map_or(JsonValue::Null, $to_json))
            }))+
            .unwrap_or_else(|| {
                tracing::warn!(column = $idx, "Column type not decodable, returning null");
                JsonValue::Null
            })
    }};
}

fn display<T: ToString>(value: T) -> JsonValue {
    JsonValue::String(value.to_string())
}

fn rfc3339(value: DateTime<Utc>) -> JsonValue {
    JsonValue::String(value.to_rfc3339())
}

mod mysql {
    use super::*;

    pub(super) fn decode_column(
        row: &MySqlRow,
        idx: usize,
        category: TypeCategory,
        decoder: &RowDecoder,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => first_decodable!(row, idx; Decimal => |d| decoder.decimal(d)),
            // Unsigned columns only decode into unsigned types
            TypeCategory::Integer => first_decodable!(row, idx;
                i64 => JsonValue::from,
                u64 => JsonValue::from,
                i8 => JsonValue::from,
                u8 => JsonValue::from,
            ),
            TypeCategory::Boolean => first_decodable!(row, idx; bool => JsonValue::Bool),
            TypeCategory::Float => first_decodable!(row, idx;
                f64 => |f| decoder.float(f),
                f32 => |f| decoder.float(f.into()),
            ),
            TypeCategory::Binary => first_decodable!(row, idx; Vec<u8> => |b| decoder.binary(&b)),
            TypeCategory::Json => first_decodable!(row, idx; JsonValue => |j| j),
            TypeCategory::Temporal => first_decodable!(row, idx;
                DateTime<Utc> => rfc3339,
                NaiveDateTime => display,
                NaiveDate => display,
                NaiveTime => display,
                String => JsonValue::String,
            ),
            _ => first_decodable!(row, idx; String => JsonValue::String),
        }
    }
}

mod postgres {
    use super::*;

    fn array<T>(items: Vec<Option<T>>, to_json: impl Fn(T) -> JsonValue) -> JsonValue {
        items
            .into_iter()
            .map(|item| item.map_or(JsonValue::Null, &to_json))
            .collect()
    }

    pub(super) fn decode_column(
        row: &PgRow,
        idx: usize,
        category: TypeCategory,
        decoder: &RowDecoder,
    ) -> JsonValue {
        match category {
            // NUMERIC values beyond 28 significant digits do not fit Decimal
            TypeCategory::Decimal => first_decodable!(row, idx; Decimal => |d| decoder.decimal(d)),
            TypeCategory::Integer => first_decodable!(row, idx;
                i64 => JsonValue::from,
                i32 => JsonValue::from,
                i16 => JsonValue::from,
            ),
            TypeCategory::Boolean => first_decodable!(row, idx; bool => JsonValue::Bool),
            TypeCategory::Float => first_decodable!(row, idx;
                f64 => |f| decoder.float(f),
                f32 => |f| decoder.float(f.into()),
            ),
            TypeCategory::Binary => first_decodable!(row, idx; Vec<u8> => |b| decoder.binary(&b)),
            TypeCategory::Json => first_decodable!(row, idx; JsonValue => |j| j),
            TypeCategory::Uuid => first_decodable!(row, idx; uuid::Uuid => display),
            TypeCategory::Temporal => first_decodable!(row, idx;
                DateTime<Utc> => rfc3339,
                NaiveDateTime => display,
                NaiveDate => display,
                NaiveTime => display,
                String => JsonValue::String,
            ),
            TypeCategory::Array => first_decodable!(row, idx;
                Vec<Option<Decimal>> => |v| array(v, |d| decoder.decimal(d)),
                Vec<Option<i64>> => |v| array(v, JsonValue::from),
                Vec<Option<i32>> => |v| array(v, JsonValue::from),
                Vec<Option<f64>> => |v| array(v, |f| decoder.float(f)),
                Vec<Option<bool>> => |v| array(v, JsonValue::Bool),
                Vec<Option<String>> => |v| array(v, JsonValue::String),
            ),
            _ => first_decodable!(row, idx; String => JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub(super) fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
        decoder: &RowDecoder,
    ) -> JsonValue {
        match category {
            TypeCategory::Integer => first_decodable!(row, idx; i64 => JsonValue::from),
            TypeCategory::Boolean => first_decodable!(row, idx; bool => JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => {
                first_decodable!(row, idx; f64 => |f| decoder.float(f))
            }
            TypeCategory::Binary => first_decodable!(row, idx; Vec<u8> => |b| decoder.binary(&b)),
            // Expression columns carry no declared type, so fall back on the stored value
            _ => first_decodable!(row, idx;
                String => |text| text_or_json(text, type_name),
                i64 => JsonValue::from,
                f64 => |f| decoder.float(f),
                Vec<u8> => |b| decoder.binary(&b),
            ),
        }
    }

    /// SQLite stores JSON as text; parse it back for columns declared JSON.
    pub(super) fn text_or_json(text: String, type_name: &str) -> JsonValue {
        if type_name.to_ascii_lowercase().contains("json")
            && let Ok(json) = serde_json::from_str::<JsonValue>(&text)
        {
            return json;
        }
        JsonValue::String(text)
    }
}
