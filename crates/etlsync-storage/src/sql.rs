//! Statement builders derived from a [`TableSchema`].

use etlsync_core::TableSchema;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql(schema: &TableSchema) -> String {
    let mut lines = Vec::with_capacity(schema.columns.len() + 1);
    if schema.surrogate_id {
        lines.push(format!("    {} serial", quote_ident("id")));
    }
    for column in &schema.columns {
        let mut line = format!("    {} {}", quote_ident(&column.name), column.ty.sql_name());
        if column.name == schema.key_column {
            line.push_str(" NOT NULL PRIMARY KEY");
        } else if !column.nullable {
            line.push_str(" NOT NULL");
        }
        lines.push(line);
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_ident(&schema.table),
        lines.join(",\n")
    )
}

/// `INSERT … ON CONFLICT (key) DO UPDATE` touching only refreshable columns,
/// or `DO NOTHING` when the table has none.
pub fn upsert_sql(schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=schema.columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = if schema.refreshable.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments = schema
            .columns
            .iter()
            .filter(|c| schema.is_refreshable(&c.name))
            .map(|c| {
                let col = quote_ident(&c.name);
                format!("{col} = EXCLUDED.{col}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {assignments}")
    };
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders}) ON CONFLICT ({}) {conflict}",
        quote_ident(&schema.table),
        quote_ident(&schema.key_column),
    )
}

/// Single-statement reconciliation; `$1` is the array of valid keys.
pub fn delete_absent_sql(schema: &TableSchema) -> String {
    format!(
        "DELETE FROM {} WHERE NOT ({} = ANY($1))",
        quote_ident(&schema.table),
        quote_ident(&schema.key_column)
    )
}
