//! Core domain model for xrate: the normalized indicator record and its field rules.

use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "xrate-core";

/// Latest known observation of one tracked indicator, keyed by `item_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub item_id: i64,
    pub name: String,
    pub title: String,
    pub price: String,
    pub high_price: String,
    pub low_price: String,
    pub open_price: String,
    pub change_value: String,
    pub change_percent: f64,
    pub updated_at: String,
    pub dt: String,
    pub t: String,
    pub prices: String,
}

impl IndicatorRecord {
    /// Record with every non-key field empty.
    pub fn blank(item_id: i64) -> Self {
        Self {
            item_id,
            name: String::new(),
            title: String::new(),
            price: String::new(),
            high_price: String::new(),
            low_price: String::new(),
            open_price: String::new(),
            change_value: String::new(),
            change_percent: 0.0,
            updated_at: String::new(),
            dt: String::new(),
            t: String::new(),
            prices: String::new(),
        }
    }

    /// Re-applies the per-field rules. `IndicatorStore::apply` runs every record through
    /// this before writing it.
    pub fn sanitized(self) -> Self {
        Self {
            item_id: self.item_id,
            name: sanitize_text_field(&self.name),
            title: sanitize_text_field(&self.title),
            price: sanitize_text_field(&self.price),
            high_price: sanitize_text_field(&self.high_price),
            low_price: sanitize_text_field(&self.low_price),
            open_price: sanitize_text_field(&self.open_price),
            change_value: sanitize_text_field(&self.change_value),
            change_percent: normalize_percent(self.change_percent),
            updated_at: sanitize_text_field(&self.updated_at),
            dt: sanitize_text_field(&self.dt),
            t: sanitize_text_field(&self.t),
            prices: sanitize_textarea_field(&self.prices),
        }
    }
}

/// Single-line text rule: markup, percent-encoded octets and control characters are
/// removed and all whitespace collapses to single spaces.
pub fn sanitize_text_field(input: &str) -> String {
    strip_percent_octets(&strip_markup(input))
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Multi-line variant of [`sanitize_text_field`]; line breaks and tabs survive.
pub fn sanitize_textarea_field(input: &str) -> String {
    let stripped = strip_markup(&input.replace("\r\n", "\n"));
    let kept = stripped
        .chars()
        .map(|c| if c == '\r' { '\n' } else { c })
        .filter(|c| matches!(c, '\n' | '\t') || !c.is_control())
        .collect::<String>();
    strip_percent_octets(&kept).trim().to_string()
}

fn strip_markup(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return input.to_string();
    }

    let fragment = Html::parse_fragment(input);
    let mut out = String::with_capacity(input.len());
    for node in fragment.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let inside_code = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| matches!(el.name(), "script" | "style"))
        });
        if !inside_code {
            out.push_str(text);
        }
    }
    out
}

fn strip_percent_octets(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let chars = current.chars().collect::<Vec<_>>();
        let mut out = String::with_capacity(current.len());
        let mut i = 0;
        let mut removed = false;
        while i < chars.len() {
            if chars[i] == '%'
                && i + 2 < chars.len()
                && chars[i + 1].is_ascii_hexdigit()
                && chars[i + 2].is_ascii_hexdigit()
            {
                i += 3;
                removed = true;
                continue;
            }
            out.push(chars[i]);
            i += 1;
        }
        if !removed {
            return out;
        }
        current = out;
    }
}

/// Identity coercion. Accepts JSON integers, integral floats and strings that parse fully
/// as an `i64`; everything else yields `None`.
pub fn coerce_item_id(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Largest magnitude the `NUMERIC(9, 2)` percent column holds.
pub const PERCENT_LIMIT: f64 = 9_999_999.99;

/// Percent coercion: numbers pass through, strings use their longest leading numeric
/// prefix, anything else is `0.0`. The result is finite, rounded to two decimals and
/// clamped to [`PERCENT_LIMIT`].
pub fn coerce_percent(value: Option<&JsonValue>) -> f64 {
    let raw = match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => leading_number(s).unwrap_or(0.0),
        Some(JsonValue::Bool(true)) => 1.0,
        _ => 0.0,
    };
    normalize_percent(raw)
}

fn normalize_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.is_finite() {
        rounded.clamp(-PERCENT_LIMIT, PERCENT_LIMIT)
    } else {
        0.0
    }
}

fn leading_number(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start || digits > 0 {
            digits += frac_end - frac_start;
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_field_strips_markup_and_collapses_whitespace() {
        assert_eq!(
            sanitize_text_field("  <b>US</b>\n\tDollar <script>alert(1)</script> "),
            "US Dollar"
        );
        assert_eq!(sanitize_text_field("50,000"), "50,000");
        assert_eq!(sanitize_text_field("a%20b"), "ab");
        assert_eq!(sanitize_text_field("a %20 b"), "a b");
        assert_eq!(sanitize_text_field("2024-01-01 10:00:00"), "2024-01-01 10:00:00");
    }

    #[test]
    fn textarea_field_keeps_line_breaks() {
        assert_eq!(
            sanitize_textarea_field("<p>1,2</p>\r\n3,4\u{0007}\n"),
            "1,2\n3,4"
        );
    }

    #[test]
    fn item_id_coercion_accepts_numbers_and_numeric_strings() {
        assert_eq!(coerce_item_id(&json!("523875")), Some(523875));
        assert_eq!(coerce_item_id(&json!(" 137121 ")), Some(137121));
        assert_eq!(coerce_item_id(&json!(137138)), Some(137138));
        assert_eq!(coerce_item_id(&json!(42.0)), Some(42));
        assert_eq!(coerce_item_id(&json!(42.5)), None);
        assert_eq!(coerce_item_id(&json!("usd")), None);
        assert_eq!(coerce_item_id(&json!("12abc")), None);
        assert_eq!(coerce_item_id(&json!(null)), None);
        assert_eq!(coerce_item_id(&json!(true)), None);
    }

    #[test]
    fn percent_coercion_defaults_to_zero() {
        assert_eq!(coerce_percent(Some(&json!("0.4"))), 0.4);
        assert_eq!(coerce_percent(Some(&json!(-1.256))), -1.26);
        assert_eq!(coerce_percent(Some(&json!("-1.25%"))), -1.25);
        assert_eq!(coerce_percent(Some(&json!(".5"))), 0.5);
        assert_eq!(coerce_percent(Some(&json!("n/a"))), 0.0);
        assert_eq!(coerce_percent(Some(&json!(""))), 0.0);
        assert_eq!(coerce_percent(Some(&json!("1e999"))), 0.0);
        assert_eq!(coerce_percent(None), 0.0);
    }

    #[test]
    fn percent_is_clamped_to_column_range() {
        assert_eq!(coerce_percent(Some(&json!(1e7))), PERCENT_LIMIT);
        assert_eq!(coerce_percent(Some(&json!("-123456789"))), -PERCENT_LIMIT);
        assert_eq!(coerce_percent(Some(&json!(9_999_999.999))), PERCENT_LIMIT);
        assert_eq!(coerce_percent(Some(&json!(9_999_999.5))), 9_999_999.5);
    }

    #[test]
    fn sanitized_record_applies_every_field_rule() {
        let mut raw = IndicatorRecord::blank(7);
        raw.name = " <i>usd</i> ".into();
        raw.prices = "1\n2 ".into();
        raw.change_percent = f64::NAN;
        let clean = raw.sanitized();
        assert_eq!(clean.item_id, 7);
        assert_eq!(clean.name, "usd");
        assert_eq!(clean.prices, "1\n2");
        assert_eq!(clean.change_percent, 0.0);
    }
}
