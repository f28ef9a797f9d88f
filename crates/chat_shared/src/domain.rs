use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConnectionId);

/// Composite channel identifier in `type:id` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    channel_type: String,
    channel_id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cid '{0}': expected <type>:<id>")]
pub struct InvalidCid(pub String);

impl std::str::FromStr for Cid {
    type Err = InvalidCid;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once(':') {
            Some((channel_type, channel_id)) if !channel_type.is_empty() && !channel_id.is_empty() => {
                Ok(Self::new(channel_type, channel_id))
            }
            _ => Err(InvalidCid(raw.to_string())),
        }
    }
}

impl TryFrom<String> for Cid {
    type Error = InvalidCid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cid> for String {
    fn from(value: Cid) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Regular,
    Reply,
    Deleted,
    System,
    Ephemeral,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cid_into_type_and_id() {
        let cid: Cid = "messaging:general".parse().expect("cid");
        assert_eq!(cid.channel_type(), "messaging");
        assert_eq!(cid.channel_id(), "general");
        assert_eq!(cid.to_string(), "messaging:general");
    }

    #[test]
    fn keeps_colons_inside_channel_id() {
        let cid: Cid = "team:ops:alerts".parse().expect("cid");
        assert_eq!(cid.channel_type(), "team");
        assert_eq!(cid.channel_id(), "ops:alerts");
    }

    #[test]
    fn rejects_cid_without_separator() {
        assert!("general".parse::<Cid>().is_err());
        assert!(":general".parse::<Cid>().is_err());
        assert!("messaging:".parse::<Cid>().is_err());
    }

    #[test]
    fn cid_round_trips_through_json_string() {
        let cid = Cid::new("messaging", "a");
        let json = serde_json::to_string(&cid).expect("json");
        assert_eq!(json, "\"messaging:a\"");
    }
}
