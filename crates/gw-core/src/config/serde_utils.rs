//! Shared serde helpers for configuration types

/// Serialize a `Duration` as whole seconds
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "gw_core::config::serde_utils::duration_secs")]
///     connect_timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as [`duration_secs`] for optional fields
pub mod option_duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        connect: Duration,
        #[serde(default, with = "option_duration_secs")]
        retry: Option<Duration>,
    }

    #[test]
    fn test_duration_secs_serialize() {
        let t = Timeouts {
            connect: Duration::from_secs(15),
            retry: None,
        };
        assert_eq!(
            serde_json::to_string(&t).unwrap(),
            r#"{"connect":15,"retry":null}"#
        );
    }

    #[test]
    fn test_duration_secs_deserialize() {
        let t: Timeouts = serde_json::from_str(r#"{"connect":60,"retry":2}"#).unwrap();
        assert_eq!(t.connect, Duration::from_secs(60));
        assert_eq!(t.retry, Some(Duration::from_secs(2)));

        let t: Timeouts = serde_json::from_str(r#"{"connect":1}"#).unwrap();
        assert_eq!(t.retry, None);
    }
}
