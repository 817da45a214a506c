//! Frontmatter normalization against an inferred schema.
//!
//! Coercion is total: every input value maps to some output value, and a
//! value that cannot be coerced becomes `null`. Nothing in this module
//! returns an error.

use serde::Deserialize;
use serde_json::{Map, Number, Value};

use crate::schema::{FrontmatterSchema, ValueType};

/// How frontmatter is rewritten before it lands in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// Keep only properties present in the schema.
    Strict,
    /// Coerce known properties, keep unknown ones verbatim.
    #[default]
    Permissive,
    /// No normalization at all.
    Original,
}

impl NormalizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationMode::Strict => "strict",
            NormalizationMode::Permissive => "permissive",
            NormalizationMode::Original => "original",
        }
    }
}

/// Normalize one post's frontmatter map.
pub fn normalize_frontmatter(
    frontmatter: &Map<String, Value>,
    schema: &FrontmatterSchema,
    mode: NormalizationMode,
) -> Map<String, Value> {
    if mode == NormalizationMode::Original {
        return frontmatter.clone();
    }

    let mut out = Map::with_capacity(frontmatter.len());
    for (key, value) in frontmatter {
        match schema.property(key) {
            Some(prop) => {
                out.insert(key.clone(), coerce_value(value, &prop.recommended_type));
            }
            None if mode == NormalizationMode::Permissive => {
                out.insert(key.clone(), value.clone());
            }
            None => {}
        }
    }
    out
}

/// Coerce a value towards `target`. Never fails.
pub fn coerce_value(value: &Value, target: &ValueType) -> Value {
    match target {
        ValueType::Boolean => coerce_boolean(value),
        ValueType::Number => coerce_number(value),
        ValueType::String => coerce_string(value),
        ValueType::Array(_) => match value {
            Value::Null | Value::Array(_) => value.clone(),
            scalar => Value::Array(vec![scalar.clone()]),
        },
        // Dates stay text; objects and nulls pass through
        _ => value.clone(),
    }
}

fn coerce_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) | Value::Null => value.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Value::Bool(true),
            Some(f) if f == 0.0 => Value::Bool(false),
            _ => Value::Null,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" | "" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn coerce_number(value: &Value) -> Value {
    match value {
        Value::Number(_) | Value::Null => value.clone(),
        Value::Bool(b) => Value::Number(Number::from(u8::from(*b))),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Value::Number(Number::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn coerce_string(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() == 1 => match &items[0] {
            Value::String(_) | Value::Null => items[0].clone(),
            other => Value::String(scalar_text(other)),
        },
        Value::Number(_) | Value::Bool(_) => Value::String(scalar_text(value)),
        _ => value.clone(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
