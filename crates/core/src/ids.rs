use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Milliseconds between the Unix epoch and the snowflake epoch
/// (2015-01-01T00:00:00Z).
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Number of low bits a snowflake reserves for worker/process/sequence.
const TIMESTAMP_SHIFT: u64 = 22;

macro_rules! snowflake_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Creation time encoded in the id.
            pub fn timestamp(self) -> DateTime<Utc> {
                let millis = (self.0 >> TIMESTAMP_SHIFT) as i64 + SNOWFLAKE_EPOCH_MS;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        // Snowflakes travel as decimal strings on the wire; 64-bit ids
        // overflow the number type of some JSON consumers.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse::<u64>().map(Self).map_err(serde::de::Error::custom)
            }
        }
    };
}

snowflake_id! {
    /// Unique id of a single message. Monotonically increasing, so message
    /// ordering is id ordering.
    MessageId
}

snowflake_id! {
    /// Unique id of a channel (text channel, DM, or thread).
    ChannelId
}

snowflake_id! {
    /// Unique id of a guild.
    GuildId
}

snowflake_id! {
    /// Unique id of a user account.
    UserId
}

snowflake_id! {
    /// Unique id of an uploaded attachment.
    AttachmentId
}
