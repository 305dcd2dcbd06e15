//! Serialization helpers for Duration types.
//!
//! Durations are written as whole milliseconds so config files stay readable.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize Duration as milliseconds.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Deserialize Duration from milliseconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Same encoding for `Option<Duration>`; `None` maps to null.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Timings {
        #[serde(with = "crate::serde_millis")]
        delay: Duration,
        #[serde(with = "crate::serde_millis::option", default)]
        deadline: Option<Duration>,
    }

    #[test]
    fn durations_serialize_as_millis() {
        let t = Timings {
            delay: Duration::from_millis(1500),
            deadline: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"delay":1500,"deadline":null}"#);
    }

    #[test]
    fn missing_optional_duration_defaults_to_none() {
        let t: Timings = serde_json::from_str(r#"{"delay":20}"#).unwrap();
        assert_eq!(t.delay, Duration::from_millis(20));
        assert!(t.deadline.is_none());
    }
}
