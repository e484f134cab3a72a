//! Type-and-constraint validators for request parameters (spec §4.4).

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ApitapError, Result};

/// Tagged validator variant. Each is a pure predicate over a string input,
/// possibly producing a parsed value for downstream use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    Int {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
        regex: Option<String>,
    },
    Enum {
        allowed: Vec<String>,
    },
    Email,
    Uuid,
    Date {
        min: Option<String>,
        max: Option<String>,
    },
    Time {
        min: Option<String>,
        max: Option<String>,
    },
}

impl Validator {
    /// Human-readable rule description, used in error messages
    /// (e.g. "must be an integer with min: 1").
    pub fn describe(&self) -> String {
        match self {
            Validator::Int { min, max } => describe_range("must be an integer", *min, *max),
            Validator::Float { min, max } => describe_range("must be a number", *min, *max),
            Validator::String {
                min_length,
                max_length,
                regex,
            } => {
                let mut parts = Vec::new();
                if let Some(m) = min_length {
                    parts.push(format!("min_length: {m}"));
                }
                if let Some(m) = max_length {
                    parts.push(format!("max_length: {m}"));
                }
                if let Some(r) = regex {
                    parts.push(format!("regex: {r}"));
                }
                if parts.is_empty() {
                    "must be a string".to_string()
                } else {
                    format!("must be a string with {}", parts.join(", "))
                }
            }
            Validator::Enum { allowed } => format!("must be one of: {}", allowed.join(", ")),
            Validator::Email => "must be a valid email address".to_string(),
            Validator::Uuid => "must be a valid UUID".to_string(),
            Validator::Date { .. } => "must be a valid ISO-8601 date".to_string(),
            Validator::Time { .. } => "must be a valid ISO-8601 time".to_string(),
        }
    }

    /// Validates `raw`, returning the parsed value on success.
    pub fn validate(&self, field_name: &str, raw: &str) -> Result<Value> {
        self.validate_inner(raw).map_err(|rule| {
            ApitapError::Validation(format!("{field_name} - {rule}"))
        })
    }

    fn validate_inner(&self, raw: &str) -> std::result::Result<Value, String> {
        match self {
            Validator::Int { min, max } => {
                let n: i64 = raw
                    .parse()
                    .map_err(|_| self.describe())?;
                check_range(n, *min, *max, &self.describe())?;
                Ok(Value::from(n))
            }
            Validator::Float { min, max } => {
                let n: f64 = raw.parse().map_err(|_| self.describe())?;
                check_range(n, *min, *max, &self.describe())?;
                Ok(Value::from(n))
            }
            Validator::String {
                min_length,
                max_length,
                regex,
            } => {
                let len = raw.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        return Err(self.describe());
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        return Err(self.describe());
                    }
                }
                if let Some(pattern) = regex {
                    let re = Regex::new(pattern).map_err(|e| e.to_string())?;
                    if !re.is_match(raw) {
                        return Err(self.describe());
                    }
                }
                Ok(Value::from(raw))
            }
            Validator::Enum { allowed } => {
                if allowed.iter().any(|a| a == raw) {
                    Ok(Value::from(raw))
                } else {
                    Err(self.describe())
                }
            }
            Validator::Email => {
                let parts: Vec<&str> = raw.splitn(2, '@').collect();
                if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                    return Err(self.describe());
                }
                if !parts[1].contains('.') {
                    return Err(self.describe());
                }
                if raw.matches('@').count() != 1 {
                    return Err(self.describe());
                }
                Ok(Value::from(raw))
            }
            Validator::Uuid => {
                if is_valid_uuid(raw) {
                    Ok(Value::from(raw.to_lowercase()))
                } else {
                    Err(self.describe())
                }
            }
            Validator::Date { min, max } => {
                let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| self.describe())?;
                if let Some(min) = min {
                    let min_date =
                        NaiveDate::parse_from_str(min, "%Y-%m-%d").map_err(|e| e.to_string())?;
                    if date < min_date {
                        return Err(self.describe());
                    }
                }
                if let Some(max) = max {
                    let max_date =
                        NaiveDate::parse_from_str(max, "%Y-%m-%d").map_err(|e| e.to_string())?;
                    if date > max_date {
                        return Err(self.describe());
                    }
                }
                Ok(Value::from(raw))
            }
            Validator::Time { min, max } => {
                let time = chrono::NaiveTime::parse_from_str(raw, "%H:%M:%S")
                    .or_else(|_| chrono::NaiveTime::parse_from_str(raw, "%H:%M"))
                    .map_err(|_| self.describe())?;
                if let Some(min) = min {
                    let min_time = parse_time(min).map_err(|e| e.to_string())?;
                    if time < min_time {
                        return Err(self.describe());
                    }
                }
                if let Some(max) = max {
                    let max_time = parse_time(max).map_err(|e| e.to_string())?;
                    if time > max_time {
                        return Err(self.describe());
                    }
                }
                Ok(Value::from(raw))
            }
        }
    }
}

fn parse_time(s: &str) -> std::result::Result<chrono::NaiveTime, chrono::ParseError> {
    chrono::NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| chrono::NaiveTime::parse_from_str(s, "%H:%M"))
}

fn describe_range<T: std::fmt::Display>(base: &str, min: Option<T>, max: Option<T>) -> String {
    let mut parts = Vec::new();
    if let Some(m) = min {
        parts.push(format!("min: {m}"));
    }
    if let Some(m) = max {
        parts.push(format!("max: {m}"));
    }
    if parts.is_empty() {
        base.to_string()
    } else {
        format!("{base} with {}", parts.join(", "))
    }
}

fn check_range<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>, rule: &str) -> std::result::Result<(), String> {
    if let Some(min) = min {
        if value < min {
            return Err(rule.to_string());
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(rule.to_string());
        }
    }
    Ok(())
}

fn is_valid_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let expected_lens = [8usize, 4, 4, 4, 12];
    if groups.len() != 5 {
        return false;
    }
    groups
        .iter()
        .zip(expected_lens.iter())
        .all(|(g, len)| g.len() == *len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_within_range_parses() {
        let v = Validator::Int {
            min: Some(1),
            max: Some(100),
        };
        assert_eq!(v.validate("id", "42").unwrap(), Value::from(42));
    }

    #[test]
    fn int_below_min_fails_with_message() {
        let v = Validator::Int {
            min: Some(1),
            max: None,
        };
        let err = v.validate("id", "-1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameter: id - must be an integer with min: 1"
        );
    }

    #[test]
    fn int_non_numeric_fails() {
        let v = Validator::Int {
            min: Some(1),
            max: None,
        };
        assert!(v.validate("id", "abc").is_err());
    }

    #[test]
    fn validator_idempotence_property() {
        // If v(x) succeeds, the parsed value's string form re-validated by v also succeeds.
        let v = Validator::Int {
            min: Some(0),
            max: Some(1000),
        };
        let parsed = v.validate("id", "42").unwrap();
        let as_str = parsed.as_i64().unwrap().to_string();
        assert!(v.validate("id", &as_str).is_ok());
    }

    #[test]
    fn string_length_and_regex() {
        let v = Validator::String {
            min_length: Some(2),
            max_length: Some(5),
            regex: Some("^[a-z]+$".to_string()),
        };
        assert!(v.validate("name", "ab").is_ok());
        assert!(v.validate("name", "a").is_err());
        assert!(v.validate("name", "abcdef").is_err());
        assert!(v.validate("name", "AB").is_err());
    }

    #[test]
    fn enum_membership_is_case_sensitive() {
        let v = Validator::Enum {
            allowed: vec!["red".to_string(), "green".to_string()],
        };
        assert!(v.validate("color", "red").is_ok());
        assert!(v.validate("color", "Red").is_err());
    }

    #[test]
    fn email_requires_single_at_and_dotted_domain() {
        let v = Validator::Email;
        assert!(v.validate("email", "a@b.com").is_ok());
        assert!(v.validate("email", "a@@b.com").is_err());
        assert!(v.validate("email", "a@b").is_err());
        assert!(v.validate("email", "@b.com").is_err());
    }

    #[test]
    fn uuid_validates_8_4_4_4_12_hex_groups() {
        let v = Validator::Uuid;
        assert!(v.validate("id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(v.validate("id", "550E8400-E29B-41D4-A716-446655440000").is_ok());
        assert!(v.validate("id", "not-a-uuid").is_err());
    }

    #[test]
    fn date_bounds_are_inclusive() {
        let v = Validator::Date {
            min: Some("2020-01-01".to_string()),
            max: Some("2020-12-31".to_string()),
        };
        assert!(v.validate("d", "2020-01-01").is_ok());
        assert!(v.validate("d", "2020-12-31").is_ok());
        assert!(v.validate("d", "2019-12-31").is_err());
        assert!(v.validate("d", "2021-01-01").is_err());
    }

    #[test]
    fn time_parses_hh_mm_and_hh_mm_ss() {
        let v = Validator::Time {
            min: None,
            max: None,
        };
        assert!(v.validate("t", "08:30").is_ok());
        assert!(v.validate("t", "08:30:15").is_ok());
        assert!(v.validate("t", "not-a-time").is_err());
    }
}
