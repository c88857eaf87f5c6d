mod event;
mod schema;

pub use event::{EventKind, LogEntry, RetryUpdate};
pub use schema::{ColumnDescriptor, FieldType, SchemaDescriptor, TableDescriptor};
