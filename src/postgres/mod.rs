pub mod connection;
pub mod decoder;
pub mod flow;
pub mod lsn;
pub mod protocol;
pub mod relation;
pub mod stream;
pub mod tuple;
pub mod types;


pub use connection::{PgTransport, ReplicationConnection, SystemInfo};
pub use decoder::PgOutputDecoder;
pub use flow::FlowController;
pub use lsn::Lsn;
pub use protocol::{CopyDataFrame, Keepalive, StandbyStatusUpdate, XLogData};
pub use relation::{ColumnSchema, RelationCache, RelationSchema, ReplicaIdentity};
pub use stream::{EventSink, ReplicationTransport, StopHandle, StreamingLoop};
pub use tuple::{ColumnData, DecodedValue, Row, TupleData, TypeRegistry};
pub use types::{ChangeEvent, OriginInfo, TypeInfo};
