//! ABRP (A Better Route Planner) telemetry payload shaping.
//!
//! ABRP expects a flat `tlm` JSON object with its own field names,
//! URL-form-encoded into the POST body as `token=<t>&tlm=<encoded JSON>`.
//! The endpoint answers HTTP 200 even on logical errors, so success is
//! decided by the `status` field of the response body.

use log::error;
use serde_json::{Map, Number, Value};

/// Internal snapshot key → ABRP telemetry key.
pub const FIELD_MAP: [(&str, &str); 20] = [
    ("SOC", "soc"),
    ("HV_W", "power"),
    ("SPEED", "speed"),
    ("CHARGING", "is_charging"),
    ("CHARGING_DC", "is_dcfc"),
    ("PARK_BRAKE", "is_parked"),
    ("HV_CAPACITY_KWH", "capacity"),
    ("HV_CAPACITY_R", "soe"),
    ("SOH", "soh"),
    ("TMP_A", "ext_temp"),
    ("BATT_TEMP", "batt_temp"),
    ("HV_V", "voltage"),
    ("HV_A", "current"),
    ("ODOMETER", "odometer"),
    ("RANGE", "est_battery_range"),
    ("T_CAB", "cabin_temp"),
    ("TYRE_P_FL", "tire_pressure_fl"),
    ("TYRE_P_FR", "tire_pressure_fr"),
    ("TYRE_P_RL", "tire_pressure_rl"),
    ("TYRE_P_RR", "tire_pressure_rr"),
];

/// Keys ABRP accepts as-is when the snapshot already carries them.
const PASSTHROUGH_KEYS: [&str; 3] = ["lat", "lon", "elevation"];

/// Longest numeric prefix of a string, `strtod`-style: `"3.14 bar"` is
/// 3.14, `"bar"` is not a number at all.
fn leading_f64(s: &str) -> Option<f64> {
    let s = s.trim();
    let mut best = None;
    for end in 1..=s.len() {
        if !s.is_char_boundary(end) {
            continue;
        }
        if let Ok(parsed) = s[..end].parse::<f64>() {
            best = Some(parsed);
        }
    }
    best
}

/// Coerce a snapshot value into what ABRP expects: numbers stay, booleans
/// and on/off strings become 0/1, strings with a numeric prefix are
/// parsed, anything else passes through as a string.
fn coerce_value(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::Bool(b) => Some(Value::Number(Number::from(i32::from(*b)))),
        Value::String(s) => {
            if s.eq_ignore_ascii_case("on") {
                Some(Value::Number(Number::from(1)))
            } else if s.eq_ignore_ascii_case("off") {
                Some(Value::Number(Number::from(0)))
            } else if let Some(parsed) = leading_f64(s) {
                Number::from_f64(parsed).map(Value::Number)
            } else {
                Some(value.clone())
            }
        }
        _ => None,
    }
}

/// Build the flat `tlm` object from a snapshot, injecting `utc` (Unix
/// seconds) when the snapshot does not carry one.
pub fn build_payload(raw_json: &str, utc: u64) -> Option<String> {
    let src: Value = match serde_json::from_str(raw_json) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to parse snapshot JSON for ABRP telemetry: {e}");
            return None;
        }
    };
    let src = src.as_object()?;

    let mut tlm = Map::new();
    for (from, to) in FIELD_MAP {
        if let Some(coerced) = src.get(from).and_then(coerce_value) {
            tlm.insert(to.to_string(), coerced);
        }
    }
    for key in PASSTHROUGH_KEYS {
        if !tlm.contains_key(key) {
            if let Some(coerced) = src.get(key).and_then(coerce_value) {
                tlm.insert(key.to_string(), coerced);
            }
        }
    }
    if !tlm.contains_key("utc") {
        tlm.insert("utc".to_string(), Value::Number(Number::from(utc)));
    }

    Some(Value::Object(tlm).to_string())
}

/// Percent-encode for form data; unreserved characters pass through.
pub fn url_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

/// `token=<t>&tlm=<encoded>` form body; the token is omitted when absent.
pub fn form_body(token: Option<&str>, tlm_json: &str) -> String {
    let encoded = url_encode(tlm_json);
    match token {
        Some(t) if !t.is_empty() => format!("token={t}&tlm={encoded}"),
        _ => format!("tlm={encoded}"),
    }
}

/// ABRP returns HTTP 200 even on logical errors; inspect the body.
pub fn is_logical_success(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(|s| s == "ok"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_payload_renames_and_coerces() {
        let raw = r#"{"SOC": 62.3, "HV_W": -4500, "CHARGING": "off"}"#;
        let tlm = build_payload(raw, 1_700_000_000).unwrap();
        assert_eq!(
            tlm,
            r#"{"soc":62.3,"power":-4500,"is_charging":0,"utc":1700000000}"#
        );
    }

    #[test]
    fn test_build_payload_passthrough_and_existing_utc() {
        let raw = r#"{"lat": 52.1, "lon": "4.3", "utc": 123, "IGNORED": 9}"#;
        let tlm = build_payload(raw, 999).unwrap();
        let value: serde_json::Value = serde_json::from_str(&tlm).unwrap();
        assert_eq!(value["lat"], 52.1);
        assert_eq!(value["lon"], 4.3);
        // utc is not a mapped key; the injected clock value is used
        assert_eq!(value["utc"], 999);
        assert!(value.get("IGNORED").is_none());
    }

    #[test]
    fn test_coerce_on_off_and_bools() {
        assert_eq!(coerce_value(&Value::String("on".into())).unwrap(), 1);
        assert_eq!(coerce_value(&Value::String("OFF".into())).unwrap(), 0);
        assert_eq!(coerce_value(&Value::Bool(true)).unwrap(), 1);
        assert_eq!(coerce_value(&Value::String("12.5".into())).unwrap(), 12.5);
        assert_eq!(
            coerce_value(&Value::String("garage".into())).unwrap(),
            Value::String("garage".into())
        );
    }

    #[test]
    fn test_coerce_numeric_prefix_like_strtod() {
        assert_eq!(coerce_value(&Value::String("3.14 bar".into())).unwrap(), 3.14);
        assert_eq!(coerce_value(&Value::String("-40degC".into())).unwrap(), -40.0);
        assert_eq!(leading_f64("12.5kPa"), Some(12.5));
        assert_eq!(leading_f64("garage"), None);
    }

    #[test]
    fn test_form_body_encoding() {
        let tlm = r#"{"soc":62.3,"power":-4500,"is_charging":0,"utc":1700000000}"#;
        let body = form_body(Some("XYZ"), tlm);
        assert_eq!(
            body,
            "token=XYZ&tlm=%7B%22soc%22%3A62.3%2C%22power%22%3A-4500%2C%22is_charging%22%3A0%2C%22utc%22%3A1700000000%7D"
        );

        let body = form_body(None, "{}");
        assert_eq!(body, "tlm=%7B%7D");
    }

    #[test]
    fn test_logical_success() {
        assert!(is_logical_success(r#"{"status":"ok","result":"done"}"#));
        assert!(!is_logical_success(r#"{"status":"error"}"#));
        assert!(!is_logical_success("not json"));
        assert!(!is_logical_success(""));
    }
}
