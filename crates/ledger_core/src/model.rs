use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{EntityId, Hlc, LedgerError, LedgerResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum SourceTable {
    Building,
    Electrical,
    Plumbing,
}

impl SourceTable {
    pub const ALL: [SourceTable; 3] = [Self::Building, Self::Electrical, Self::Plumbing];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Electrical => "electrical",
            Self::Plumbing => "plumbing",
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SourceTable {
    type Error = LedgerError;

    fn try_from(value: String) -> LedgerResult<Self> {
        value.parse()
    }
}

impl FromStr for SourceTable {
    type Err = LedgerError;

    fn from_str(value: &str) -> LedgerResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "building" => Ok(Self::Building),
            "electrical" => Ok(Self::Electrical),
            "plumbing" => Ok(Self::Plumbing),
            other => Err(LedgerError::invalid(format!("unknown source table '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactRole {
    Applicant,
    Contractor,
    Architect,
    Engineer,
    #[default]
    Other,
}

impl ContactRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applicant => "applicant",
            Self::Contractor => "contractor",
            Self::Architect => "architect",
            Self::Engineer => "engineer",
            Self::Other => "other",
        }
    }

    /// Lenient parse used for feed values; anything unrecognised is `Other`.
    pub fn from_feed(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "applicant" | "owner" => Self::Applicant,
            "contractor" => Self::Contractor,
            "architect" => Self::Architect,
            "engineer" => Self::Engineer,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ContactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactRole {
    type Err = LedgerError;

    fn from_str(value: &str) -> LedgerResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "applicant" => Ok(Self::Applicant),
            "contractor" => Ok(Self::Contractor),
            "architect" => Ok(Self::Architect),
            "engineer" => Ok(Self::Engineer),
            "other" => Ok(Self::Other),
            other => Err(LedgerError::invalid(format!("unknown contact role '{other}'"))),
        }
    }
}

/// Role as stored on an entity, qualified by the permit type it was seen on.
pub fn role_label(source_table: SourceTable, role: ContactRole) -> String {
    format!("{}_{}", source_table.as_str(), role.as_str())
}

/// One mention of a party on one permit record.
///
/// Decoding is lenient: roles go through [`ContactRole::from_feed`] and the
/// free-text fields accept numbers as well as strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContactRecord {
    pub source_table: SourceTable,
    #[serde(deserialize_with = "record_id_text")]
    pub source_record_id: String,
    #[serde(default, deserialize_with = "feed_role")]
    pub role: ContactRole,
    #[serde(default, deserialize_with = "name_text")]
    pub raw_name: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub raw_license: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub address_hint: Option<String>,
}

fn scalar_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(scalar_text(Option::<Value>::deserialize(deserializer)?))
}

fn name_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(optional_text(deserializer)?.unwrap_or_default())
}

fn record_id_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    optional_text(deserializer)?
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| D::Error::custom("source_record_id must be a non-empty string or number"))
}

fn feed_role<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ContactRole, D::Error> {
    Ok(optional_text(deserializer)?
        .map(|role| ContactRole::from_feed(&role))
        .unwrap_or_default())
}

impl RawContactRecord {
    pub fn mention_key(&self) -> MentionKey {
        MentionKey {
            source_table: self.source_table,
            source_record_id: self.source_record_id.clone(),
            role: self.role,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MentionKey {
    pub source_table: SourceTable,
    pub source_record_id: String,
    pub role: ContactRole,
}

impl MentionKey {
    pub fn founding_entity_id(&self) -> EntityId {
        EntityId::for_mention(
            self.source_table.as_str(),
            &self.source_record_id,
            self.role.as_str(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub canonical_name: String,
    pub normalized_license: Option<String>,
    pub roles: BTreeSet<String>,
    pub first_seen: Hlc,
    pub last_seen: Hlc,
}

/// Undirected weighted edge; `entity_id_a < entity_id_b` always holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub entity_id_a: EntityId,
    pub entity_id_b: EntityId,
    pub shared_permits: i64,
    pub last_shared_at: Hlc,
}

impl Relationship {
    pub fn other_endpoint(&self, entity_id: EntityId) -> Option<EntityId> {
        if self.entity_id_a == entity_id {
            Some(self.entity_id_b)
        } else if self.entity_id_b == entity_id {
            Some(self.entity_id_a)
        } else {
            None
        }
    }
}

/// Orders a pair canonically; `None` for a self-pair.
pub fn canonical_pair(x: EntityId, y: EntityId) -> Option<(EntityId, EntityId)> {
    match x.cmp(&y) {
        std::cmp::Ordering::Less => Some((x, y)),
        std::cmp::Ordering::Greater => Some((y, x)),
        std::cmp::Ordering::Equal => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub batch_id: String,
    pub source_table: SourceTable,
    pub cursor_start: i64,
    pub cursor_position: i64,
    pub row_count: i64,
    pub committed_at: Hlc,
}

impl IngestionBatch {
    pub fn batch_id_for(source_table: SourceTable, cursor_start: i64) -> String {
        format!("{}:{cursor_start}", source_table.as_str())
    }
}

/// One entry of an entity's depth-1 neighborhood.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub entity: Entity,
    pub shared_permits: i64,
    pub last_shared_at: Hlc,
}
