//! Resource key construction and subscribe-request validation rules.
//!
//! A resource key names one live-data stream:
//! `"<dataClass>:<namespace>:<ownerId>[:<subKey>]"`, where the data class is
//! `ts` (time-series) or `ad` (aggregate) and the namespace is `user`,
//! `device`, or `athlete`. The key is the unit of subscription and the unit
//! of fan-out lookup.

/// Time-series data class.
pub const DATA_CLASS_TIME_SERIES: &str = "ts";

/// Aggregate data class.
pub const DATA_CLASS_AGGREGATE: &str = "ad";

/// All valid data classes.
pub const DATA_CLASSES: [&str; 2] = [DATA_CLASS_TIME_SERIES, DATA_CLASS_AGGREGATE];

/// Sample rates a subscribe request may carry.
pub const ALLOWED_SAMPLE_RATES: [u32; 4] = [1, 2, 5, 10];

/// Resource types that may be subscribed to. The value of each is used for
/// resource key name-spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceNamespace {
    User,
    Device,
    Athlete,
}

impl ResourceNamespace {
    /// The namespace segment used in resource keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceNamespace::User => "user",
            ResourceNamespace::Device => "device",
            ResourceNamespace::Athlete => "athlete",
        }
    }
}

/// Build a namespaced resource key.
pub fn namespaced_resource(
    data_class: &str,
    namespace: ResourceNamespace,
    owner_id: &str,
    sub_key: Option<&str>,
) -> String {
    match sub_key {
        Some(sub_key) => format!("{}:{}:{}:{}", data_class, namespace.as_str(), owner_id, sub_key),
        None => format!("{}:{}:{}", data_class, namespace.as_str(), owner_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_carries_sub_key() {
        assert_eq!(
            namespaced_resource("ts", ResourceNamespace::Device, "u1", Some("d1")),
            "ts:device:u1:d1"
        );
    }

    #[test]
    fn user_key_has_no_sub_key() {
        assert_eq!(
            namespaced_resource("ad", ResourceNamespace::User, "u1", None),
            "ad:user:u1"
        );
    }
}
