use sqlx::{PgPool, Row};

use crate::types::{ColumnDescriptor, FieldType, SchemaDescriptor, TableDescriptor};

/// Reads every user table of the given schema and produces a typed descriptor.
///
/// Columns are returned in ordinal order so field numbering is stable across
/// runs. Views are excluded; only base tables can fire row triggers.
pub async fn introspect_schema(
    pool: &PgPool,
    schema_name: &str,
) -> Result<SchemaDescriptor, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        select c.table_name, c.column_name, c.data_type
        from information_schema.columns c
        join information_schema.tables t
            on t.table_schema = c.table_schema and t.table_name = c.table_name
        where c.table_schema = $1
            and t.table_type = 'BASE TABLE'
        order by c.table_name, c.ordinal_position
        "#,
    )
    .bind(schema_name)
    .fetch_all(pool)
    .await?;

    let mut tables: Vec<TableDescriptor> = Vec::new();
    for row in rows {
        let table_name: String = row.try_get("table_name")?;
        let column_name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;

        let column = ColumnDescriptor {
            name: column_name,
            field_type: FieldType::from_pg_type(&data_type),
        };

        match tables.last_mut() {
            Some(table) if table.name == table_name => table.columns.push(column),
            _ => tables.push(TableDescriptor {
                name: table_name,
                columns: vec![column],
            }),
        }
    }

    Ok(SchemaDescriptor::new(tables))
}
