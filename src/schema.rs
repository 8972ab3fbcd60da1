//! DDL for the `sales` schema: the generic EAV substrate every upload
//! lands in, plus the tenant header-mapping table. All statements are
//! idempotent so bootstrap can run on every boot.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub const SCHEMA: &str = "sales";

/// Stable entity_type ids, seeded by bootstrap.
pub const ENTITY_TYPE_SALES_BATCH: i16 = 1;
pub const ENTITY_TYPE_TRANSACTION: i16 = 2;
pub const ENTITY_TYPE_LINE_ITEM: i16 = 3;
pub const ENTITY_TYPE_ADDRESS: i16 = 4;

const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS sales",
    // duplicate_object guard: CREATE TYPE has no IF NOT EXISTS
    r#"DO $$ BEGIN
        CREATE TYPE sales.attr_data_type AS ENUM
            ('string', 'numeric', 'boolean', 'timestamptz', 'jsonb');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"CREATE TABLE IF NOT EXISTS sales.entity_types (
        id   SMALLINT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )"#,
    r#"INSERT INTO sales.entity_types (id, name) VALUES
        (1, 'sales_batch'),
        (2, 'transaction'),
        (3, 'line_item'),
        (4, 'address')
    ON CONFLICT (id) DO NOTHING"#,
    r#"CREATE TABLE IF NOT EXISTS sales.entities (
        id               UUID PRIMARY KEY,
        entity_type_id   SMALLINT NOT NULL REFERENCES sales.entity_types (id),
        parent_entity_id UUID REFERENCES sales.entities (id)
    )"#,
    "CREATE INDEX IF NOT EXISTS entities_parent_idx ON sales.entities (parent_entity_id)",
    r#"CREATE TABLE IF NOT EXISTS sales.attributes (
        id             UUID PRIMARY KEY,
        entity_type_id SMALLINT NOT NULL REFERENCES sales.entity_types (id),
        name           TEXT NOT NULL,
        data_type      sales.attr_data_type NOT NULL,
        description    TEXT,
        UNIQUE (entity_type_id, name, data_type)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sales.entity_attribute_values (
        entity_id     UUID NOT NULL REFERENCES sales.entities (id),
        attribute_id  UUID NOT NULL REFERENCES sales.attributes (id),
        value_string  TEXT,
        value_numeric NUMERIC,
        value_boolean BOOLEAN,
        value_ts      TIMESTAMPTZ,
        value_jsonb   JSONB,
        PRIMARY KEY (entity_id, attribute_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sales.client_header_map (
        tenant_id     TEXT NOT NULL,
        mapped_header TEXT NOT NULL,
        attribute_id  UUID NOT NULL REFERENCES sales.attributes (id),
        UNIQUE (tenant_id, mapped_header)
    )"#,
];

pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    for stmt in DDL {
        sqlx::raw_sql(stmt).execute(pool).await?;
    }
    info!(schema = SCHEMA, "schema bootstrap complete");
    Ok(())
}

/// Quote an identifier for interpolation into DDL/DML. Staging table and
/// column names come from callers, so everything goes through this.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `sales."<table>"`
pub fn qualified(table: &str) -> String {
    format!("{}.{}", SCHEMA, quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("upload_1"), "sales.\"upload_1\"");
    }
}
