//! Small serde helpers shared by the model types.

use serde::de::{Error, Unexpected, Visitor};
use serde::{Deserializer, Serialize, Serializer};
use std::fmt;

/// Deserialize a Discord snowflake from either a JSON number or a string.
pub fn deserialize_id<'d, D: Deserializer<'d>>(d: D) -> Result<u64, D::Error> {
    struct IdVisitor;
    impl<'d> Visitor<'d> for IdVisitor {
        type Value = u64;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "a u64 or parseable string")
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<u64, E> {
            v.parse::<u64>()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_any(IdVisitor)
}

/// Serialize a snowflake as a string, matching Discord's own wire format.
pub fn serialize_id<S: Serializer>(id: &u64, s: S) -> Result<S::Ok, S::Error> {
    id.to_string().serialize(s)
}
