use std::collections::BTreeMap;

/// The logical type of a table column, reduced from the Postgres type system
/// to the closed set the expression language understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    I64,
    F64,
    Bool,
    String,
    Bytes,
    /// Opaque structured value (json, hstore, arrays, anything unmapped).
    Dynamic,
}

impl FieldType {
    /// Maps an `information_schema.columns.data_type` string to a logical type.
    ///
    /// Arrays surface as `ARRAY` in information_schema and collapse to
    /// [`FieldType::Dynamic`], as does anything unrecognized.
    pub fn from_pg_type(data_type: &str) -> FieldType {
        match data_type.to_ascii_lowercase().as_str() {
            "integer" | "bigint" | "smallint" | "serial" | "bigserial" | "smallserial" => {
                FieldType::I64
            }
            "text" | "character varying" | "varchar" | "character" | "char" | "uuid" | "money"
            | "xml" | "timestamp without time zone" | "timestamp with time zone" | "timestamp"
            | "timestamptz" | "date" | "time without time zone" | "time with time zone"
            | "time" | "timetz" | "interval" | "cidr" | "inet" | "macaddr" | "macaddr8"
            | "point" | "line" | "lseg" | "box" | "path" | "polygon" | "circle" => {
                FieldType::String
            }
            "boolean" => FieldType::Bool,
            "real" | "double precision" | "numeric" | "decimal" => FieldType::F64,
            "bytea" | "bit" | "bit varying" => FieldType::Bytes,
            _ => FieldType::Dynamic,
        }
    }
}

/// One column of an introspected table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

/// The logical shape of one table, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Looks up a column's logical type by name.
    pub fn field_type(&self, column: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.field_type)
    }
}

/// The full set of typed table shapes the agent works against.
///
/// Built once at startup from `information_schema`, narrowed by ignore rules,
/// and treated as immutable for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDescriptor {
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(tables: impl IntoIterator<Item = TableDescriptor>) -> SchemaDescriptor {
        SchemaDescriptor {
            tables: tables
                .into_iter()
                .map(|table| (table.name.clone(), table))
                .collect(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Drops a whole table from the descriptor.
    pub fn remove_table(&mut self, name: &str) {
        self.tables.remove(name);
    }

    /// Drops the named columns from a table, if present.
    pub fn remove_columns(&mut self, table: &str, columns: &[String]) {
        if let Some(descriptor) = self.tables.get_mut(table) {
            descriptor
                .columns
                .retain(|c| !columns.iter().any(|ignored| ignored == &c.name));
        }
    }
}
