use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::{Error, Result};

/// How much of the old row image the source table is configured to publish
/// with update and delete events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'd' => Ok(ReplicaIdentity::Default),
            b'n' => Ok(ReplicaIdentity::Nothing),
            b'f' => Ok(ReplicaIdentity::Full),
            b'i' => Ok(ReplicaIdentity::Index),
            _ => Err(Error::InvalidMessage {
                message: format!("unknown replica identity byte: {}", b),
            }),
        }
    }
}

/// One column of a relation as announced by the protocol.
///
/// Column order is significant: tuple data in row messages for the same
/// relation id aligns positionally with this descriptor list.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared type OID.
    pub type_id: u32,
    /// Type modifier (e.g. varchar length); -1 when absent.
    pub type_modifier: i32,
    /// True when the column is part of the replica identity key.
    pub is_key: bool,
}

/// A table's column layout as last announced on the stream.
#[derive(Debug, Clone, Serialize)]
pub struct RelationSchema {
    /// Session-scoped relation identifier row messages refer back to.
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnSchema>,
}

/// Schemas keyed by relation id.
///
/// Row-carrying messages reference relations by a small integer id and never
/// repeat the schema inline, so the decoder must remember schemas announced
/// earlier in the same logical stream. Entries are only ever superseded by a
/// newer relation message, never evicted.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationSchema>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite the schema under its relation id.
    pub fn put(&mut self, schema: RelationSchema) {
        debug!(
            "RELATION: {}={}.{} ({} columns)",
            schema.id,
            schema.namespace,
            schema.name,
            schema.columns.len()
        );
        self.relations.insert(schema.id, schema);
    }

    /// Look up the current schema for a relation id.
    ///
    /// A miss means a row event arrived before its relation announcement,
    /// which the protocol does not allow.
    pub fn get(&self, id: u32) -> Result<&RelationSchema> {
        self.relations
            .get(&id)
            .ok_or(Error::UnknownRelation { relation_id: id })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(id: u32, name: &str) -> RelationSchema {
        RelationSchema {
            id,
            namespace: "public".to_string(),
            name: name.to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: vec![ColumnSchema {
                name: "id".to_string(),
                type_id: 23,
                type_modifier: -1,
                is_key: true,
            }],
        }
    }

    #[test]
    fn get_before_put_is_unknown_relation() {
        let cache = RelationCache::new();
        match cache.get(42) {
            Err(Error::UnknownRelation { relation_id }) => assert_eq!(relation_id, 42),
            other => panic!("expected UnknownRelation, got {:?}", other),
        }
    }

    #[test]
    fn put_then_get() {
        let mut cache = RelationCache::new();
        cache.put(schema(7, "users"));
        assert_eq!(cache.get(7).unwrap().name, "users");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_supersedes_previous_schema() {
        let mut cache = RelationCache::new();
        cache.put(schema(7, "users"));
        cache.put(schema(7, "users_v2"));
        assert_eq!(cache.get(7).unwrap().name, "users_v2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replica_identity_bytes() {
        assert_eq!(
            ReplicaIdentity::from_byte(b'f').unwrap(),
            ReplicaIdentity::Full
        );
        assert!(ReplicaIdentity::from_byte(b'x').is_err());
    }
}
