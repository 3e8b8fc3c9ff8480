//! Canonical column types
//!
//! Every database reports column types in its own spelling (`character varying(255)`,
//! `VARCHAR(255)`, `int4`, `INTEGER`, ...). Declared and introspected schemas are both
//! parsed into [`ColumnType`] so that drift detection compares meaning rather than text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SchemaError;

/// Vendor-agnostic column type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    /// Auto-incrementing 32-bit integer
    Serial,
    /// Auto-incrementing 64-bit integer
    BigSerial,
    Real,
    Double,
    Decimal {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Boolean,
    /// Fixed-length character string, `None` when no length was given
    Char(Option<u32>),
    /// Variable-length character string, `None` means unbounded
    VarChar(Option<u32>),
    Text,
    Bytes,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
    /// Anything without a canonical mapping, kept in normalized (lowercase) form
    Other(String),
}

/// How a type conversion affects the values a column can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthChange {
    Same,
    Widening,
    Narrowing,
    Incompatible,
}

impl WidthChange {
    /// Whether existing values may be truncated or rejected by the conversion
    pub fn is_lossy(&self) -> bool {
        matches!(self, WidthChange::Narrowing | WidthChange::Incompatible)
    }
}

impl ColumnType {
    /// Parse a vendor type name into its canonical form.
    pub fn from_native(raw: &str) -> Result<Self, SchemaError> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Err(SchemaError::InvalidType(raw.to_string()));
        }

        let (base, args) = split_type_arguments(&lowered)?;
        let first = args.first().copied();
        let second = args.get(1).copied();

        let parsed = match base.as_str() {
            "smallint" | "int2" | "smallserial" | "serial2" | "tinyint" => ColumnType::SmallInt,
            "integer" | "int" | "int4" | "mediumint" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::BigInt,
            "serial" | "serial4" => ColumnType::Serial,
            "bigserial" | "serial8" => ColumnType::BigSerial,
            "real" | "float4" => ColumnType::Real,
            "double precision" | "double" | "float8" | "float" => ColumnType::Double,
            "numeric" | "decimal" => ColumnType::Decimal {
                precision: first,
                scale: second.or(first.map(|_| 0)),
            },
            "boolean" | "bool" => ColumnType::Boolean,
            "character" | "char" | "bpchar" | "nchar" => ColumnType::Char(first),
            "character varying" | "varchar" | "nvarchar" | "varchar2" => {
                ColumnType::VarChar(first)
            }
            "text" | "clob" | "tinytext" | "mediumtext" | "longtext" | "string" => {
                ColumnType::Text
            }
            "bytea" | "blob" | "binary" | "varbinary" => ColumnType::Bytes,
            "date" => ColumnType::Date,
            "time" | "time without time zone" => ColumnType::Time,
            "timetz" | "time with time zone" => ColumnType::TimeTz,
            "timestamp" | "timestamp without time zone" | "datetime" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            _ => ColumnType::Other(collapse_whitespace(&lowered)),
        };

        Ok(parsed)
    }

    /// The type as seen by drift detection: serial columns are plain integers
    /// with a sequence attached, so they compare equal to their storage type.
    pub fn comparable(&self) -> ColumnType {
        match self {
            ColumnType::Serial => ColumnType::Integer,
            ColumnType::BigSerial => ColumnType::BigInt,
            other => other.clone(),
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, ColumnType::Serial | ColumnType::BigSerial)
    }

    /// Promote an integer column to its serial form.
    pub fn as_serial(&self) -> ColumnType {
        match self {
            ColumnType::Integer | ColumnType::Serial => ColumnType::Serial,
            ColumnType::BigInt | ColumnType::BigSerial => ColumnType::BigSerial,
            other => other.clone(),
        }
    }

    /// Classify converting a column from `self` to `target`.
    pub fn width_change(&self, target: &ColumnType) -> WidthChange {
        use ColumnType::*;

        let from = self.comparable();
        let to = target.comparable();
        if from == to {
            return WidthChange::Same;
        }

        match (&from, &to) {
            (SmallInt | Integer | BigInt, SmallInt | Integer | BigInt) => {
                if integer_rank(&to) > integer_rank(&from) {
                    WidthChange::Widening
                } else {
                    WidthChange::Narrowing
                }
            }
            (Real, Double) => WidthChange::Widening,
            (Double, Real) => WidthChange::Narrowing,
            (
                Decimal {
                    precision: p1,
                    scale: s1,
                },
                Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => compare_decimal(*p1, *s1, *p2, *s2),
            (Char(a), Char(b)) | (VarChar(a), VarChar(b)) | (Char(a), VarChar(b)) => {
                compare_length(*a, *b)
            }
            (VarChar(_), Char(_)) => WidthChange::Narrowing,
            (Char(_) | VarChar(_), Text) => WidthChange::Widening,
            (Text, VarChar(None)) => WidthChange::Widening,
            (Text, Char(_) | VarChar(Some(_))) => WidthChange::Narrowing,
            (Time, TimeTz) | (Timestamp, TimestampTz) => WidthChange::Widening,
            (TimeTz, Time) | (TimestampTz, Timestamp) => WidthChange::Narrowing,
            (Jsonb, Json) => WidthChange::Widening,
            (Json, Jsonb) => WidthChange::Narrowing,
            (Json | Jsonb | Uuid, Text | VarChar(None)) => WidthChange::Widening,
            _ => WidthChange::Incompatible,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "smallint"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Serial => write!(f, "serial"),
            ColumnType::BigSerial => write!(f, "bigserial"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::Double => write!(f, "double precision"),
            ColumnType::Decimal {
                precision: Some(p),
                scale: Some(s),
            } => write!(f, "numeric({},{})", p, s),
            ColumnType::Decimal {
                precision: Some(p),
                scale: None,
            } => write!(f, "numeric({})", p),
            ColumnType::Decimal { .. } => write!(f, "numeric"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Char(Some(n)) => write!(f, "char({})", n),
            ColumnType::Char(None) => write!(f, "char"),
            ColumnType::VarChar(Some(n)) => write!(f, "varchar({})", n),
            ColumnType::VarChar(None) => write!(f, "varchar"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Bytes => write!(f, "bytea"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Time => write!(f, "time"),
            ColumnType::TimeTz => write!(f, "timetz"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::TimestampTz => write!(f, "timestamptz"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Jsonb => write!(f, "jsonb"),
            ColumnType::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for ColumnType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColumnType::from_native(s)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ColumnType::from_native(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// Normalize a column default expression for comparison.
///
/// Returns `None` when the expression is equivalent to having no default.
pub fn normalize_default(expression: &str) -> Option<String> {
    let mut expr = expression.trim().to_string();

    while expr.starts_with('(') && expr.ends_with(')') && wrapped_by_outer_parens(&expr) {
        expr = expr[1..expr.len() - 1].trim().to_string();
    }

    // Strip `::type` casts that sit outside any string literal.
    while let Some(pos) = expr.rfind("::") {
        let last_quote = expr.rfind('\'');
        if last_quote.is_some_and(|q| q > pos) {
            break;
        }
        expr = expr[..pos].trim().to_string();
    }

    if expr.is_empty() {
        return None;
    }

    if expr.starts_with('\'') {
        return Some(expr);
    }

    let lowered = expr.to_ascii_lowercase();
    match lowered.as_str() {
        "null" => None,
        "now()" | "current_timestamp" | "current_timestamp()" => {
            Some("current_timestamp".to_string())
        }
        _ => Some(lowered),
    }
}

fn integer_rank(ty: &ColumnType) -> u8 {
    match ty {
        ColumnType::SmallInt => 1,
        ColumnType::Integer => 2,
        ColumnType::BigInt => 3,
        _ => 0,
    }
}

fn compare_length(from: Option<u32>, to: Option<u32>) -> WidthChange {
    match (from, to) {
        (None, None) => WidthChange::Same,
        (Some(_), None) => WidthChange::Widening,
        (None, Some(_)) => WidthChange::Narrowing,
        (Some(a), Some(b)) if b >= a => WidthChange::Widening,
        _ => WidthChange::Narrowing,
    }
}

fn compare_decimal(
    p1: Option<u32>,
    s1: Option<u32>,
    p2: Option<u32>,
    s2: Option<u32>,
) -> WidthChange {
    match (p1, p2) {
        (None, None) => {
            if s2.unwrap_or(0) >= s1.unwrap_or(0) {
                WidthChange::Widening
            } else {
                WidthChange::Narrowing
            }
        }
        (Some(_), None) => WidthChange::Widening,
        (None, Some(_)) => WidthChange::Narrowing,
        (Some(p1), Some(p2)) => {
            let s1 = s1.unwrap_or(0);
            let s2 = s2.unwrap_or(0);
            if s2 >= s1 && p2.saturating_sub(s2) >= p1.saturating_sub(s1) {
                WidthChange::Widening
            } else {
                WidthChange::Narrowing
            }
        }
    }
}

/// Split `timestamp(3) with time zone` into (`timestamp with time zone`, [3]).
fn split_type_arguments(lowered: &str) -> Result<(String, Vec<u32>), SchemaError> {
    let Some(open) = lowered.find('(') else {
        return Ok((collapse_whitespace(lowered), Vec::new()));
    };
    let close = lowered[open..]
        .find(')')
        .map(|offset| open + offset)
        .ok_or_else(|| SchemaError::InvalidType(lowered.to_string()))?;

    let base = format!("{} {}", &lowered[..open], &lowered[close + 1..]);
    let mut args = Vec::new();
    for part in lowered[open + 1..close].split(',') {
        match part.trim().parse::<u32>() {
            Ok(value) => args.push(value),
            // `varchar(max)` and friends carry no usable bound
            Err(_) => return Ok((collapse_whitespace(&base), Vec::new())),
        }
    }

    Ok((collapse_whitespace(&base), args))
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn wrapped_by_outer_parens(expr: &str) -> bool {
    let mut depth = 0i32;
    for (i, ch) in expr.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != expr.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
