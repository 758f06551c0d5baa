use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{LedgerError, LedgerResult};

// Fixed namespace for deterministic entity ids; changing it re-keys every entity.
const ENTITY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1c, 0x52, 0x9e, 0x3a, 0x44, 0x4b, 0x0d, 0x9a, 0x1e, 0x27, 0x5c, 0x83, 0x0b, 0xd4, 0x61,
]);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    /// Name-based id: the same name always yields the same id on every backend.
    pub fn derived(name: &str) -> Self {
        Self(*Uuid::new_v5(&ENTITY_NAMESPACE, name.as_bytes()).as_bytes())
    }

    pub fn from_uuid_str(value: &str) -> LedgerResult<Self> {
        let uuid = Uuid::parse_str(value)
            .map_err(|err| LedgerError::invalid(format!("invalid uuid '{value}': {err}")))?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    pub fn as_uuid(self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_bytes(self.0);
        write!(f, "{uuid}")
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Uuid::parse_str(&value)
            .map(|uuid| Id::from_bytes(*uuid.as_bytes()))
            .map_err(|_| serde::de::Error::custom("invalid Id string"))
    }
}

/// Canonical party id. Ordering matches the byte order of the underlying UUID,
/// which is also the lexical order of its hyphenated string form.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub Id);

impl EntityId {
    /// Id of the entity founded by the given mention key.
    pub fn for_mention(source_table: &str, source_record_id: &str, role: &str) -> Self {
        Self(Id::derived(&format!(
            "entity/{source_table}/{source_record_id}/{role}"
        )))
    }

    pub fn parse(value: &str) -> LedgerResult<Self> {
        Id::from_uuid_str(value).map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! id_wrapper_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(Self(Id::deserialize(deserializer)?))
            }
        }
    };
}

id_wrapper_serde!(EntityId);
