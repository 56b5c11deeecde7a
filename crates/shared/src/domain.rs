use std::{convert::Infallible, fmt, str::FromStr};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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
id_newtype!(ChannelId);
id_newtype!(MessageId);

const GENERATED_SUFFIX_LEN: usize = 9;

impl MessageId {
    /// Client-side id assigned before the durable store has seen the message.
    ///
    /// Shape is `msg_<unix-millis>_<suffix>`; the suffix comes from a v4 uuid so two
    /// sends within the same millisecond still differ.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "msg_{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..GENERATED_SUFFIX_LEN]
        ))
    }
}

/// Kind of a message. Values this client does not know are carried through as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    #[default]
    Text,
    System,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Text => "text",
            MessageType::System => "system",
            MessageType::Other(value) => value,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "text" => MessageType::Text,
            "system" => MessageType::System,
            _ => MessageType::Other(normalized),
        })
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(message_type) => message_type,
            Err(never) => match never {},
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}
