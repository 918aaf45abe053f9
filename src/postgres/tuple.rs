use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use super::relation::RelationSchema;
use crate::{Error, Result};

/// One column entry of a row message, as tagged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    /// Explicit SQL NULL.
    Null,
    /// TOASTed value that did not change; the previous value still stands
    /// and no bytes were sent.
    UnchangedToast,
    /// Text-format payload.
    Text(Bytes),
    /// Binary-format payload.
    Binary(Bytes),
}

/// The raw column entries of a single row, positionally aligned with the
/// referenced relation's column descriptors.
///
/// Produced by the message decoder for exactly one event and consumed
/// immediately by [`decode_tuple`]; never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleData {
    pub columns: Vec<ColumnData>,
}

/// Wire format of a column payload handed to a decode function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Text,
    Binary,
}

/// A column value resolved against its declared type.
///
/// `Raw` is the fallback for type OIDs the registry does not recognize: the
/// payload bytes interpreted as UTF-8 verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Raw(String),
}

/// A decoded row: column name to value. Columns tagged unchanged-toast are
/// omitted entirely, which is how "unchanged" stays distinguishable from
/// "explicitly null".
pub type Row = BTreeMap<String, DecodedValue>;

/// A decoding function for one type OID.
///
/// Receives the raw payload and its wire format; returns the decoded value
/// or a description of why the payload is malformed for the type.
pub type DecodeFn = fn(&[u8], ValueFormat) -> std::result::Result<DecodedValue, String>;

/// Maps type OIDs to decoding functions.
///
/// [`TypeRegistry::default`] knows the common scalar types; callers can
/// [`register`](TypeRegistry::register) more. Lookups for unregistered OIDs
/// return `None` and the tuple decoder falls back to verbatim text.
pub struct TypeRegistry {
    decoders: HashMap<u32, DecodeFn>,
}

impl TypeRegistry {
    /// An empty registry; every value falls back to verbatim text.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for a type OID.
    pub fn register(&mut self, type_id: u32, decode: DecodeFn) {
        self.decoders.insert(type_id, decode);
    }

    /// Decode `raw` as the given type OID, or `None` if the OID is not
    /// registered.
    pub fn decode(
        &self,
        type_id: u32,
        format: ValueFormat,
        raw: &[u8],
    ) -> Option<std::result::Result<DecodedValue, String>> {
        self.decoders.get(&type_id).map(|f| f(raw, format))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(16, decode_bool); // bool
        registry.register(21, decode_int); // int2
        registry.register(23, decode_int); // int4
        registry.register(20, decode_int); // int8
        registry.register(700, decode_float); // float4
        registry.register(701, decode_float); // float8
        registry.register(25, decode_text); // text
        registry.register(1043, decode_text); // varchar
        registry
    }
}

/// Resolve one row's raw columns against a relation schema.
///
/// Positions align with the schema's column order; a count mismatch means
/// the message cannot be trusted. Decode failures for recognized types carry
/// the column name and OID so the caller can tell which value was bad.
pub fn decode_tuple(
    schema: &RelationSchema,
    tuple: &TupleData,
    registry: &TypeRegistry,
) -> Result<Row> {
    if tuple.columns.len() != schema.columns.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "Column count mismatch for relation {}: {} vs {}",
                schema.id,
                tuple.columns.len(),
                schema.columns.len()
            ),
        });
    }

    let mut row = Row::new();
    for (column, data) in schema.columns.iter().zip(&tuple.columns) {
        let (raw, format) = match data {
            ColumnData::Null => {
                row.insert(column.name.clone(), DecodedValue::Null);
                continue;
            }
            // Omitted: the previous value is unchanged.
            ColumnData::UnchangedToast => continue,
            ColumnData::Text(raw) => (raw, ValueFormat::Text),
            ColumnData::Binary(raw) => (raw, ValueFormat::Binary),
        };

        let value = match registry.decode(column.type_id, format, raw) {
            Some(Ok(value)) => value,
            Some(Err(message)) => {
                return Err(Error::Decode {
                    column: column.name.clone(),
                    type_oid: column.type_id,
                    message,
                })
            }
            None => DecodedValue::Raw(String::from_utf8_lossy(raw).into_owned()),
        };
        row.insert(column.name.clone(), value);
    }

    Ok(row)
}

fn decode_bool(raw: &[u8], format: ValueFormat) -> std::result::Result<DecodedValue, String> {
    match format {
        ValueFormat::Text => match raw {
            b"t" => Ok(DecodedValue::Bool(true)),
            b"f" => Ok(DecodedValue::Bool(false)),
            _ => Err(format!("not a bool: {:?}", String::from_utf8_lossy(raw))),
        },
        ValueFormat::Binary => match raw {
            [b] => Ok(DecodedValue::Bool(*b != 0)),
            _ => Err(format!("bool wants 1 byte, got {}", raw.len())),
        },
    }
}

fn decode_int(raw: &[u8], format: ValueFormat) -> std::result::Result<DecodedValue, String> {
    match format {
        ValueFormat::Text => std::str::from_utf8(raw)
            .map_err(|e| e.to_string())?
            .parse::<i64>()
            .map(DecodedValue::Int)
            .map_err(|e| e.to_string()),
        ValueFormat::Binary => match raw.len() {
            2 => Ok(DecodedValue::Int(
                i16::from_be_bytes([raw[0], raw[1]]) as i64
            )),
            4 => Ok(DecodedValue::Int(
                i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            )),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(DecodedValue::Int(i64::from_be_bytes(buf)))
            }
            n => Err(format!("integer wants 2, 4 or 8 bytes, got {}", n)),
        },
    }
}

fn decode_float(raw: &[u8], format: ValueFormat) -> std::result::Result<DecodedValue, String> {
    match format {
        ValueFormat::Text => std::str::from_utf8(raw)
            .map_err(|e| e.to_string())?
            .parse::<f64>()
            .map(DecodedValue::Float)
            .map_err(|e| e.to_string()),
        ValueFormat::Binary => match raw.len() {
            4 => Ok(DecodedValue::Float(
                f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            )),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(DecodedValue::Float(f64::from_be_bytes(buf)))
            }
            n => Err(format!("float wants 4 or 8 bytes, got {}", n)),
        },
    }
}

fn decode_text(raw: &[u8], _format: ValueFormat) -> std::result::Result<DecodedValue, String> {
    String::from_utf8(raw.to_vec())
        .map(DecodedValue::Text)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::relation::{ColumnSchema, ReplicaIdentity};

    fn schema(columns: &[(&str, u32)]) -> RelationSchema {
        RelationSchema {
            id: 1,
            namespace: "public".to_string(),
            name: "t".to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: columns
                .iter()
                .map(|(name, type_id)| ColumnSchema {
                    name: name.to_string(),
                    type_id: *type_id,
                    type_modifier: -1,
                    is_key: false,
                })
                .collect(),
        }
    }

    fn text(s: &str) -> ColumnData {
        ColumnData::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn decodes_recognized_types() {
        let schema = schema(&[("id", 23), ("name", 25), ("active", 16), ("score", 701)]);
        let tuple = TupleData {
            columns: vec![text("7"), text("alice"), text("t"), text("2.5")],
        };
        let row = decode_tuple(&schema, &tuple, &TypeRegistry::default()).unwrap();
        assert_eq!(row["id"], DecodedValue::Int(7));
        assert_eq!(row["name"], DecodedValue::Text("alice".to_string()));
        assert_eq!(row["active"], DecodedValue::Bool(true));
        assert_eq!(row["score"], DecodedValue::Float(2.5));
    }

    #[test]
    fn unknown_oid_falls_back_to_raw_text() {
        let schema = schema(&[("payload", 3802)]); // jsonb, unregistered
        let tuple = TupleData {
            columns: vec![text(r#"{"k":1}"#)],
        };
        let row = decode_tuple(&schema, &tuple, &TypeRegistry::default()).unwrap();
        assert_eq!(row["payload"], DecodedValue::Raw(r#"{"k":1}"#.to_string()));
    }

    #[test]
    fn all_toast_yields_empty_row() {
        let schema = schema(&[("a", 25), ("b", 25)]);
        let tuple = TupleData {
            columns: vec![ColumnData::UnchangedToast, ColumnData::UnchangedToast],
        };
        let row = decode_tuple(&schema, &tuple, &TypeRegistry::default()).unwrap();
        assert!(row.is_empty());
    }

    #[test]
    fn all_null_yields_null_entries() {
        let schema = schema(&[("a", 25), ("b", 25)]);
        let tuple = TupleData {
            columns: vec![ColumnData::Null, ColumnData::Null],
        };
        let row = decode_tuple(&schema, &tuple, &TypeRegistry::default()).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["a"], DecodedValue::Null);
        assert_eq!(row["b"], DecodedValue::Null);
    }

    #[test]
    fn malformed_payload_reports_column_and_oid() {
        let schema = schema(&[("id", 23)]);
        let tuple = TupleData {
            columns: vec![text("not-a-number")],
        };
        match decode_tuple(&schema, &tuple, &TypeRegistry::default()) {
            Err(Error::Decode {
                column, type_oid, ..
            }) => {
                assert_eq!(column, "id");
                assert_eq!(type_oid, 23);
            }
            other => panic!("expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn column_count_mismatch_is_invalid() {
        let schema = schema(&[("a", 25), ("b", 25)]);
        let tuple = TupleData {
            columns: vec![text("only-one")],
        };
        assert!(matches!(
            decode_tuple(&schema, &tuple, &TypeRegistry::default()),
            Err(Error::InvalidMessage { .. })
        ));
    }

    #[test]
    fn binary_payloads_decode() {
        let schema = schema(&[("id", 23), ("flag", 16), ("big", 20)]);
        let tuple = TupleData {
            columns: vec![
                ColumnData::Binary(Bytes::copy_from_slice(&42i32.to_be_bytes())),
                ColumnData::Binary(Bytes::copy_from_slice(&[1])),
                ColumnData::Binary(Bytes::copy_from_slice(&(-9i64).to_be_bytes())),
            ],
        };
        let row = decode_tuple(&schema, &tuple, &TypeRegistry::default()).unwrap();
        assert_eq!(row["id"], DecodedValue::Int(42));
        assert_eq!(row["flag"], DecodedValue::Bool(true));
        assert_eq!(row["big"], DecodedValue::Int(-9));
    }

    #[test]
    fn custom_registration_overrides_fallback() {
        let mut registry = TypeRegistry::empty();
        registry.register(2950, |raw, _| {
            Ok(DecodedValue::Text(
                String::from_utf8_lossy(raw).to_uppercase(),
            ))
        });
        let schema = schema(&[("id", 2950)]);
        let tuple = TupleData {
            columns: vec![text("abc")],
        };
        let row = decode_tuple(&schema, &tuple, &registry).unwrap();
        assert_eq!(row["id"], DecodedValue::Text("ABC".to_string()));
    }
}
