use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Coerce a loosely-typed document value into a float, falling back to a
/// default for anything that does not look like a number.
pub fn safe_float(value: &Value, default: f64) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(default),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(default),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => default,
    }
}

/// Render a label value as a plain string, the way operators write them in
/// node descriptors (strings, numbers, and booleans all occur in the wild).
pub fn label_string(labels: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    match labels.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Num(f64),
    Text(String),
    Flag(bool),
    Null,
}

impl Loose {
    fn to_f64(&self) -> Option<f64> {
        match self {
            Loose::Num(v) => Some(*v),
            Loose::Text(s) => s.trim().parse::<f64>().ok(),
            Loose::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            Loose::Null => None,
        }
    }
}

pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let loose = Option::<Loose>::deserialize(deserializer)?;
    Ok(loose.and_then(|l| l.to_f64()).unwrap_or(0.0))
}

pub fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let loose = Option::<Loose>::deserialize(deserializer)?;
    Ok(loose.and_then(|l| l.to_f64()))
}

pub fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let loose = Option::<Loose>::deserialize(deserializer)?;
    Ok(match loose {
        Some(Loose::Text(s)) if !s.is_empty() => Some(s),
        Some(Loose::Num(v)) => Some(if v.fract() == 0.0 {
            format!("{}", v as i64)
        } else {
            format!("{v}")
        }),
        Some(Loose::Flag(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_float_coerces_strings_and_defaults() {
        assert_eq!(safe_float(&json!(4), 0.0), 4.0);
        assert_eq!(safe_float(&json!("2.5"), 0.0), 2.5);
        assert_eq!(safe_float(&json!("not-a-number"), 7.0), 7.0);
        assert_eq!(safe_float(&json!(null), 7.0), 7.0);
        assert_eq!(safe_float(&json!(true), 0.0), 1.0);
    }

    #[test]
    fn label_string_renders_scalars() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), json!("east"));
        labels.insert("rack".to_string(), json!(12));
        labels.insert("empty".to_string(), json!(""));
        assert_eq!(label_string(&labels, "zone").as_deref(), Some("east"));
        assert_eq!(label_string(&labels, "rack").as_deref(), Some("12"));
        assert_eq!(label_string(&labels, "empty"), None);
        assert_eq!(label_string(&labels, "missing"), None);
    }

    #[derive(Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "lenient_f64")]
        cores: f64,
        #[serde(default, deserialize_with = "lenient_opt_f64")]
        tdp_w: Option<f64>,
    }

    #[test]
    fn lenient_fields_tolerate_junk() {
        let s: Sample = serde_yaml::from_str("cores: \"8\"\ntdp_w: oops\n").unwrap();
        assert_eq!(s.cores, 8.0);
        assert_eq!(s.tdp_w, None);

        let s: Sample = serde_yaml::from_str("cores: null\n").unwrap();
        assert_eq!(s.cores, 0.0);
    }
}
