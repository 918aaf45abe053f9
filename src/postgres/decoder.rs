use bytes::Buf;
use tracing::{debug, trace};

use super::protocol::pg_time_to_utc;
use super::relation::{ColumnSchema, RelationCache, RelationSchema, ReplicaIdentity};
use super::tuple::{decode_tuple, ColumnData, TupleData, TypeRegistry};
use super::types::{ChangeEvent, OriginInfo, TypeInfo};
use super::lsn::Lsn;
use crate::{Error, Result};

/// Decodes pgoutput logical-message payloads into [`ChangeEvent`]s.
///
/// One payload in, exactly one event out. Row-carrying messages resolve
/// their relation id through the caller's [`RelationCache`], which must have
/// seen the relation announcement earlier on the same stream, and their
/// tuples are decoded immediately through the registry. Tags this decoder
/// does not know yield [`ChangeEvent::Unhandled`] rather than an error, so
/// protocol extensions do not break the stream.
pub struct PgOutputDecoder {
    registry: TypeRegistry,
}

impl PgOutputDecoder {
    pub fn new(registry: TypeRegistry) -> Self {
        Self { registry }
    }

    /// Decode one WAL-data payload.
    pub fn decode(&self, relations: &mut RelationCache, data: &[u8]) -> Result<ChangeEvent> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Err(Error::InvalidMessage {
                message: "empty logical message".to_string(),
            });
        }

        let msg_type = cursor.get_u8();
        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(relations, cursor),
            b'I' => self.decode_insert(relations, cursor),
            b'U' => self.decode_update(relations, cursor),
            b'D' => self.decode_delete(relations, cursor),
            b'T' => self.decode_truncate(cursor),
            b'Y' => self.decode_type(cursor),
            b'O' => self.decode_origin(cursor),
            tag => {
                debug!("unhandled pgoutput message type: {}", tag as char);
                Ok(ChangeEvent::Unhandled { tag })
            }
        }
    }

    fn decode_begin(&self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 20, "BEGIN")?;
        let final_lsn = Lsn(cursor.get_u64());
        let commit_time = pg_time_to_utc(cursor.get_i64());
        let xid = cursor.get_u32();

        trace!("BEGIN: lsn={}, xid={}", final_lsn, xid);
        Ok(ChangeEvent::Begin {
            xid,
            final_lsn,
            commit_time,
        })
    }

    fn decode_commit(&self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 25, "COMMIT")?;
        let _flags = cursor.get_u8();
        let commit_lsn = Lsn(cursor.get_u64());
        let end_lsn = Lsn(cursor.get_u64());
        let commit_time = pg_time_to_utc(cursor.get_i64());

        trace!("COMMIT: lsn={}", commit_lsn);
        Ok(ChangeEvent::Commit {
            commit_lsn,
            end_lsn,
            commit_time,
        })
    }

    fn decode_relation(
        &self,
        relations: &mut RelationCache,
        mut cursor: &[u8],
    ) -> Result<ChangeEvent> {
        need(&cursor, 4, "RELATION")?;
        let rel_id = cursor.get_u32();
        let namespace = get_cstr(&mut cursor)?;
        let name = get_cstr(&mut cursor)?;
        need(&cursor, 3, "RELATION")?;
        let replica_identity = ReplicaIdentity::from_byte(cursor.get_u8())?;
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            need(&cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let col_name = get_cstr(&mut cursor)?;
            need(&cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let type_modifier = cursor.get_i32();

            columns.push(ColumnSchema {
                name: col_name,
                type_id,
                type_modifier,
                is_key: (flags & 1) != 0,
            });
        }

        let schema = RelationSchema {
            id: rel_id,
            namespace,
            name,
            replica_identity,
            columns,
        };
        relations.put(schema.clone());

        Ok(ChangeEvent::Relation { schema })
    }

    fn decode_insert(&self, relations: &RelationCache, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 5, "INSERT")?;
        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple marker in INSERT: {}", tuple_type as char),
            });
        }

        let schema = relations.get(rel_id)?;
        let tuple = read_tuple_data(&mut cursor)?;
        let new = decode_tuple(schema, &tuple, &self.registry)?;

        trace!("INSERT: relation={}", rel_id);
        Ok(ChangeEvent::Insert {
            relation_id: rel_id,
            new,
        })
    }

    fn decode_update(&self, relations: &RelationCache, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 5, "UPDATE")?;
        let rel_id = cursor.get_u32();
        let schema = relations.get(rel_id)?;

        let mut old = None;
        let mut marker = cursor.get_u8();
        if marker == b'K' || marker == b'O' {
            let tuple = read_tuple_data(&mut cursor)?;
            old = Some(decode_tuple(schema, &tuple, &self.registry)?);
            need(&cursor, 1, "UPDATE")?;
            marker = cursor.get_u8();
        }
        if marker != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple marker in UPDATE: {}", marker as char),
            });
        }
        let tuple = read_tuple_data(&mut cursor)?;
        let new = decode_tuple(schema, &tuple, &self.registry)?;

        trace!("UPDATE: relation={}", rel_id);
        Ok(ChangeEvent::Update {
            relation_id: rel_id,
            old,
            new,
        })
    }

    fn decode_delete(&self, relations: &RelationCache, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 5, "DELETE")?;
        let rel_id = cursor.get_u32();
        let marker = cursor.get_u8();
        if marker != b'K' && marker != b'O' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple marker in DELETE: {}", marker as char),
            });
        }

        let schema = relations.get(rel_id)?;
        let tuple = read_tuple_data(&mut cursor)?;
        let old = Some(decode_tuple(schema, &tuple, &self.registry)?);

        trace!("DELETE: relation={}", rel_id);
        Ok(ChangeEvent::Delete {
            relation_id: rel_id,
            old,
        })
    }

    fn decode_truncate(&self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 5, "TRUNCATE")?;
        let num_relations = cursor.get_u32();
        let _options = cursor.get_u8();

        need(&cursor, num_relations as usize * 4, "TRUNCATE")?;
        let relation_ids = (0..num_relations).map(|_| cursor.get_u32()).collect();

        Ok(ChangeEvent::Truncate { relation_ids })
    }

    fn decode_type(&self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 4, "TYPE")?;
        let type_id = cursor.get_u32();
        let namespace = get_cstr(&mut cursor)?;
        let name = get_cstr(&mut cursor)?;

        Ok(ChangeEvent::Type(TypeInfo {
            type_id,
            namespace,
            name,
        }))
    }

    fn decode_origin(&self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(&cursor, 8, "ORIGIN")?;
        let commit_lsn = Lsn(cursor.get_u64());
        let name = get_cstr(&mut cursor)?;

        Ok(ChangeEvent::Origin(OriginInfo { commit_lsn, name }))
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new(TypeRegistry::default())
    }
}

/// Read the raw column entries of one tuple: a count followed by one tagged
/// entry per column.
fn read_tuple_data(cursor: &mut &[u8]) -> Result<TupleData> {
    need(cursor, 2, "tuple data")?;
    let num_columns = cursor.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        need(cursor, 1, "tuple column")?;
        let tag = cursor.get_u8();
        match tag {
            b'n' => columns.push(ColumnData::Null),
            b'u' => columns.push(ColumnData::UnchangedToast),
            b't' | b'b' => {
                need(cursor, 4, "tuple column")?;
                let len = cursor.get_i32();
                if len < 0 {
                    return Err(Error::InvalidMessage {
                        message: format!("negative column value length: {}", len),
                    });
                }
                need(cursor, len as usize, "tuple column value")?;
                let raw = cursor.copy_to_bytes(len as usize);
                columns.push(if tag == b't' {
                    ColumnData::Text(raw)
                } else {
                    ColumnData::Binary(raw)
                });
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("unknown column tag: {}", other as char),
                })
            }
        }
    }

    Ok(TupleData { columns })
}

/// Read a null-terminated string field.
fn get_cstr(cursor: &mut &[u8]) -> Result<String> {
    let end = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: "unterminated string field".to_string(),
        })?;
    let s = String::from_utf8_lossy(&cursor[..end]).into_owned();
    cursor.advance(end + 1);
    Ok(s)
}

fn need(cursor: &&[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(Error::InvalidMessage {
            message: format!(
                "truncated {} message: need {} bytes, have {}",
                what,
                len,
                cursor.remaining()
            ),
        });
    }
    Ok(())
}
