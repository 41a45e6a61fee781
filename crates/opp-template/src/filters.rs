//! Custom filters for Open Peer Power templates
//!
//! These extend minijinja's builtins with the conversions and string helpers
//! that automation templates lean on: lenient numeric casts with defaults,
//! regex helpers, slugs and JSON round-tripping.

use minijinja::value::{Kwargs, Value, ValueKind};
use minijinja::{Error, ErrorKind};
use regex::Regex;
use std::convert::TryFrom;

pub(crate) fn value_to_f64(value: &Value) -> Option<f64> {
    f64::try_from(value.clone())
        .ok()
        .or_else(|| value.as_i64().map(|i| i as f64))
}

fn value_to_bool(value: &Value) -> Option<bool> {
    bool::try_from(value.clone()).ok()
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

// ==================== String Filters ====================

/// Convert a string to a slug
pub fn slugify(value: &str, kwargs: Kwargs) -> Result<String, Error> {
    let separator: String = kwargs
        .get::<Option<String>>("separator")?
        .unwrap_or_else(|| "_".to_string());
    kwargs.assert_all_used()?;
    Ok(slug::slugify(value).replace('-', &separator))
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| invalid(format!("invalid regex: {}", e)))
}

/// Replace matches of a regex pattern with a replacement string
pub fn regex_replace(value: &str, find: &str, replace: &str) -> Result<String, Error> {
    Ok(compile(find)?.replace_all(value, replace).to_string())
}

/// Test if a regex pattern matches at the start of the value
pub fn regex_match(value: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile(pattern)?.find(value).map_or(false, |m| m.start() == 0))
}

/// Test if a regex pattern matches anywhere in the value
pub fn regex_search(value: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile(pattern)?.is_match(value))
}

/// Find all matches of a regex pattern
pub fn regex_findall(value: &str, pattern: &str) -> Result<Value, Error> {
    let re = compile(pattern)?;
    let matches: Vec<Value> = re
        .captures_iter(value)
        .map(|cap| {
            if cap.len() > 1 {
                let groups: Vec<Value> = cap
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| Value::from(m.as_str())).unwrap_or(Value::UNDEFINED))
                    .collect();
                Value::from(groups)
            } else {
                Value::from(cap.get(0).map(|m| m.as_str()).unwrap_or(""))
            }
        })
        .collect();
    Ok(Value::from(matches))
}

// ==================== Type Conversion Filters ====================

fn parse_float(value: &Value) -> Option<f64> {
    if value.kind() == ValueKind::Bool {
        return None;
    }
    value_to_f64(value).or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

/// Convert a value to float, falling back to `default` when it is not numeric
///
/// Without a default, a non-numeric value is an error so that templates
/// reading an `unknown` sensor fail loudly instead of comparing against 0.
pub fn to_float(value: Value, default: Option<Value>) -> Result<Value, Error> {
    match parse_float(&value) {
        Some(f) => Ok(Value::from(f)),
        None => match default {
            Some(d) => Ok(d),
            None => Err(invalid(format!("cannot convert {:?} to float", value.to_string()))),
        },
    }
}

/// Convert a value to integer, truncating floats
pub fn to_int(value: Value, default: Option<Value>) -> Result<Value, Error> {
    let parsed = value.as_i64().or_else(|| {
        value
            .as_str()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .or_else(|| parse_float(&value).map(|f| f as i64))
    });
    match parsed {
        Some(i) => Ok(Value::from(i)),
        None => match default {
            Some(d) => Ok(d),
            None => Err(invalid(format!("cannot convert {:?} to int", value.to_string()))),
        },
    }
}

/// Interpret a value as a boolean the same way trigger results are read
pub fn to_bool(value: Value, default: Option<bool>) -> bool {
    if value.is_undefined() || value.is_none() {
        return default.unwrap_or(false);
    }
    if let Some(b) = value_to_bool(&value) {
        return b;
    }
    if let Some(s) = value.as_str() {
        return crate::engine::result_as_boolean(s);
    }
    match value_to_f64(&value) {
        Some(f) => f != 0.0,
        None => value.is_true(),
    }
}

/// Check if value is a number or a string holding one
pub fn is_number(value: Value) -> bool {
    parse_float(&value).map_or(false, f64::is_finite)
}

// ==================== Math Filters ====================

/// Round a number to the given precision
pub fn round_filter(value: Value, precision: Option<i32>, kwargs: Kwargs) -> Result<Value, Error> {
    let method: String = kwargs
        .get::<Option<String>>("method")?
        .unwrap_or_else(|| "common".to_string());
    kwargs.assert_all_used()?;

    let number = parse_float(&value).ok_or_else(|| invalid("round requires a number"))?;
    let precision = precision.unwrap_or(0);
    let multiplier = 10_f64.powi(precision);
    let scaled = number * multiplier;

    let rounded = match method.as_str() {
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        "half" => (scaled * 2.0).round() / 2.0,
        "common" => scaled.round(),
        other => return Err(invalid(format!("unknown rounding method {}", other))),
    } / multiplier;

    if precision <= 0 {
        Ok(Value::from(rounded as i64))
    } else {
        Ok(Value::from(rounded))
    }
}

/// Calculate the average of a sequence
pub fn average(values: Value, kwargs: Kwargs) -> Result<Value, Error> {
    let default: Option<Value> = kwargs.get("default")?;
    kwargs.assert_all_used()?;

    let nums: Vec<f64> = match values.try_iter() {
        Ok(iter) => iter.filter_map(|v| parse_float(&v)).collect(),
        Err(_) => Vec::new(),
    };
    if nums.is_empty() {
        return default.ok_or_else(|| invalid("average of an empty sequence"));
    }
    Ok(Value::from(nums.iter().sum::<f64>() / nums.len() as f64))
}

// ==================== JSON Filters ====================

/// Serialize a value to a JSON string
pub fn to_json(value: Value, kwargs: Kwargs) -> Result<String, Error> {
    let pretty: bool = kwargs.get::<Option<bool>>("pretty")?.unwrap_or(false);
    kwargs.assert_all_used()?;

    if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .map_err(|e| invalid(format!("JSON error: {}", e)))
}

/// Parse a JSON string into a template value
pub fn from_json(value: &str) -> Result<Value, Error> {
    let json: serde_json::Value =
        serde_json::from_str(value).map_err(|e| invalid(format!("invalid JSON: {}", e)))?;
    Ok(Value::from_serialize(&json))
}
