use serde::{Deserialize, Deserializer, Serializer};
use time::{macros::format_description, Date};

use crate::normalize_date;

pub fn serialize<S>(value: &Date, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let format = format_description!("[year]-[month]-[day]");
    let s = value.format(&format).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&s)
}

/// Takes `YYYY-MM-DD` or `YYYYMMDD`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Date, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    normalize_date(&s).map_err(serde::de::Error::custom)
}
