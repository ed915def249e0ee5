//! Exchange wire formats: push codecs, REST ticker and candle clients

pub mod global;
pub mod local;

pub use global::{GlobalCandleClient, GlobalCodec, GlobalRestClient};
pub use local::{LocalCandleClient, LocalCodec, LocalRestClient};

use serde::{Deserialize, Deserializer};

/// Upstreams send numbers either as JSON numbers or as strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

pub(crate) fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => Ok(n),
        Numeric::Text(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
    }
}

/// Missing, null, empty or unparsable values become `None`
pub(crate) fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Numeric>::deserialize(deserializer)? {
        Some(Numeric::Number(n)) => Some(n),
        Some(Numeric::Text(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    })
}

/// Percent change from `open` to `last`, zero when `open` is unusable
pub(crate) fn change_from_open(last: f64, open: Option<f64>) -> (f64, f64) {
    match open {
        Some(open) if open > 0.0 => {
            let change = last - open;
            (change, change / open * 100.0)
        }
        _ => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "de_f64")]
        a: f64,
        #[serde(default, deserialize_with = "de_opt_f64")]
        b: Option<f64>,
    }

    #[test]
    fn test_numeric_strings_and_numbers() {
        let p: Probe = serde_json::from_str(r#"{"a":"1.5","b":2}"#).unwrap();
        assert_eq!(p.a, 1.5);
        assert_eq!(p.b, Some(2.0));

        let p: Probe = serde_json::from_str(r#"{"a":3,"b":""}"#).unwrap();
        assert_eq!(p.a, 3.0);
        assert_eq!(p.b, None);

        let p: Probe = serde_json::from_str(r#"{"a":3}"#).unwrap();
        assert_eq!(p.b, None);

        assert!(serde_json::from_str::<Probe>(r#"{"a":"abc"}"#).is_err());
    }

    #[test]
    fn test_change_from_open() {
        let (change, pct) = change_from_open(110.0, Some(100.0));
        assert!((change - 10.0).abs() < 1e-9);
        assert!((pct - 10.0).abs() < 1e-9);
        assert_eq!(change_from_open(110.0, Some(0.0)), (0.0, 0.0));
        assert_eq!(change_from_open(110.0, None), (0.0, 0.0));
    }
}
