/// `Option<SystemTime>` as milliseconds since the epoch.
pub mod optional_timestamp_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(time) => {
                let millis = time
                    .duration_since(UNIX_EPOCH)
                    .map_err(serde::ser::Error::custom)?
                    .as_millis();
                serializer.serialize_u64(millis as u64)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(|m| UNIX_EPOCH + Duration::from_millis(m)))
    }
}
