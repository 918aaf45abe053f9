use chrono::{DateTime, Utc};
use serde::Serialize;

use super::lsn::Lsn;
use super::relation::RelationSchema;
use super::tuple::Row;

/// One decoded logical replication message.
///
/// Row images are present according to the source table's replica identity:
/// old tuples only arrive when the table captures full row images (or, for
/// updates, when the key changed), and TOASTed columns that did not change
/// are simply absent from the row map.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Schema announcement for a relation; row messages that follow refer to
    /// it by id.
    Relation { schema: RelationSchema },
    /// Transaction start.
    Begin {
        xid: u32,
        final_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    /// Transaction end.
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    Insert {
        relation_id: u32,
        new: Row,
    },
    Update {
        relation_id: u32,
        old: Option<Row>,
        new: Row,
    },
    Delete {
        relation_id: u32,
        old: Option<Row>,
    },
    Truncate {
        relation_ids: Vec<u32>,
    },
    /// Composite/custom type announcement.
    Type(TypeInfo),
    /// Replication origin marker.
    Origin(OriginInfo),
    /// A message tag this decoder does not recognize. Informational, so
    /// newer server protocol versions do not break older clients.
    Unhandled { tag: u8 },
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeInfo {
    pub type_id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginInfo {
    pub commit_lsn: Lsn,
    pub name: String,
}
