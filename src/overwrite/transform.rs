//! Closed set of value transforms applied after a verified read
//!
//! Transforms are data, selected by tag, so rule tables stay serializable:
//!
//! ```toml
//! transform = { kind = "currency", symbol = "$", decimals = 2 }
//! ```

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Render the value as-is
    #[default]
    Identity,
    /// Thousands-grouped amount with a currency symbol: `$15,023.47`
    Currency { symbol: String, decimals: u8 },
    /// Reformat a timestamp or date with a strftime pattern
    Date { format: String },
    /// Mask all but the last `visible` characters
    Redact { visible: usize },
    /// Fixed-point number without grouping
    Fixed { decimals: u8 },
}

impl Transform {
    pub fn currency(symbol: impl Into<String>, decimals: u8) -> Self {
        Self::Currency {
            symbol: symbol.into(),
            decimals,
        }
    }

    pub fn date(format: impl Into<String>) -> Self {
        Self::Date {
            format: format.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Currency { .. } => "currency",
            Self::Date { .. } => "date",
            Self::Redact { .. } => "redact",
            Self::Fixed { .. } => "fixed",
        }
    }

    /// Reject parameters that can never produce output
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Date { format } => {
                if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                    Err(format!("invalid date format '{}'", format))
                } else {
                    Ok(())
                }
            }
            Self::Currency { decimals, .. } | Self::Fixed { decimals } if *decimals > 12 => {
                Err(format!("too many decimals: {}", decimals))
            }
            _ => Ok(()),
        }
    }

    /// Render a raw value; the error is a short reason
    pub fn apply(&self, raw: &serde_json::Value) -> std::result::Result<String, String> {
        match self {
            Self::Identity => scalar_text(raw),
            Self::Currency { symbol, decimals } => {
                let amount = number(raw)?;
                let grouped = group_thousands(&format!("{:.*}", *decimals as usize, amount.abs()));
                let sign = if amount < 0.0 && grouped.chars().any(|c| matches!(c, '1'..='9')) {
                    "-"
                } else {
                    ""
                };
                Ok(format!("{}{}{}", sign, symbol, grouped))
            }
            Self::Date { format } => {
                let timestamp = timestamp(raw)?;
                let mut out = String::new();
                write!(out, "{}", timestamp.format(format))
                    .map_err(|_| format!("invalid date format '{}'", format))?;
                Ok(out)
            }
            Self::Redact { visible } => {
                let text = scalar_text(raw)?;
                let chars: Vec<char> = text.chars().collect();
                if chars.len() <= *visible {
                    return Ok("*".repeat(chars.len()));
                }
                let masked = chars.len() - visible;
                Ok("*".repeat(masked) + &chars[masked..].iter().collect::<String>())
            }
            Self::Fixed { decimals } => Ok(format!("{:.*}", *decimals as usize, number(raw)?)),
        }
    }
}

fn scalar_text(raw: &serde_json::Value) -> std::result::Result<String, String> {
    match raw {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Err("value is null".into()),
        _ => Err("value is not a scalar".into()),
    }
}

fn number(raw: &serde_json::Value) -> std::result::Result<f64, String> {
    let value = match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    value
        .filter(|v| v.is_finite())
        .ok_or_else(|| "value is not a number".to_string())
}

/// `1234567.5` → `1,234,567.5`
fn group_thousands(plain: &str) -> String {
    let (int_part, frac_part) = match plain.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (plain, None),
    };
    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(plain.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    grouped
}

fn timestamp(raw: &serde_json::Value) -> std::result::Result<DateTime<Utc>, String> {
    match raw {
        serde_json::Value::Number(n) => {
            let n = n.as_i64().ok_or("timestamp is not an integer")?;
            // Values this large are milliseconds.
            let ts = if n.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(n)
            } else {
                Utc.timestamp_opt(n, 0)
            };
            ts.single().ok_or_else(|| "timestamp out of range".to_string())
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Ok(dt.and_utc());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .ok_or_else(|| "unrecognized date".to_string())
        }
        _ => Err("value is not a date".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_currency() {
        let usd = Transform::currency("$", 2);
        assert_eq!(usd.apply(&json!(15023.47)).unwrap(), "$15,023.47");
        assert_eq!(usd.apply(&json!(0)).unwrap(), "$0.00");
        assert_eq!(usd.apply(&json!(999.999)).unwrap(), "$1,000.00");
        assert_eq!(usd.apply(&json!(-1234567.5)).unwrap(), "-$1,234,567.50");
        assert_eq!(usd.apply(&json!("2500")).unwrap(), "$2,500.00");
        assert_eq!(usd.apply(&json!(-0.001)).unwrap(), "$0.00");
        assert!(usd.apply(&json!("abc")).is_err());
        assert!(usd.apply(&json!(null)).is_err());

        let ntd = Transform::currency("NT$", 0);
        assert_eq!(ntd.apply(&json!(1000000)).unwrap(), "NT$1,000,000");
    }

    #[test]
    fn test_date() {
        let t = Transform::date("%Y/%m/%d");
        assert_eq!(t.apply(&json!("2024-03-05T10:00:00Z")).unwrap(), "2024/03/05");
        assert_eq!(t.apply(&json!("2024-03-05")).unwrap(), "2024/03/05");
        assert_eq!(t.apply(&json!(0)).unwrap(), "1970/01/01");
        assert_eq!(t.apply(&json!(1_709_632_800_000i64)).unwrap(), "2024/03/05");
        assert!(t.apply(&json!("yesterday")).is_err());
    }

    #[test]
    fn test_redact() {
        let t = Transform::Redact { visible: 4 };
        assert_eq!(t.apply(&json!("4111111111111111")).unwrap(), "************1111");
        assert_eq!(t.apply(&json!("123")).unwrap(), "***");
        assert_eq!(t.apply(&json!("密碼資料很長")).unwrap(), "**資料很長");
    }

    #[test]
    fn test_fixed_and_identity() {
        assert_eq!(Transform::Fixed { decimals: 1 }.apply(&json!(2.26)).unwrap(), "2.3");
        assert_eq!(Transform::Identity.apply(&json!("Alice")).unwrap(), "Alice");
        assert_eq!(Transform::Identity.apply(&json!(42)).unwrap(), "42");
        assert!(Transform::Identity.apply(&json!(null)).is_err());
        assert!(Transform::Identity.apply(&json!([1])).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Transform::date("%Y-%m-%d").validate().is_ok());
        assert!(Transform::date("%Q").validate().is_err());
        assert!(Transform::currency("$", 20).validate().is_err());
        assert!(Transform::Identity.validate().is_ok());
    }

    #[test]
    fn test_serde_tagging() {
        let t: Transform =
            serde_json::from_value(json!({"kind": "currency", "symbol": "$", "decimals": 2}))
                .unwrap();
        assert_eq!(t, Transform::currency("$", 2));
        assert_eq!(
            serde_json::to_value(Transform::Identity).unwrap(),
            json!({"kind": "identity"})
        );
    }
}
