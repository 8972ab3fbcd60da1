//! The generic EAV substrate: typed attribute definitions, entity rows,
//! and batched value upserts shared by the address canonicalizer, the
//! prelude, and the transform workers.

pub mod prelude;
pub mod transform;

use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, QueryBuilder, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::ids;
use crate::schema;
use crate::staging::MAX_BIND_PARAMS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrDataType {
    String,
    Numeric,
    Boolean,
    Timestamptz,
    Jsonb,
}

impl AttrDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttrDataType::String => "string",
            AttrDataType::Numeric => "numeric",
            AttrDataType::Boolean => "boolean",
            AttrDataType::Timestamptz => "timestamptz",
            AttrDataType::Jsonb => "jsonb",
        }
    }

    /// Attribute data type for a staging column's current Postgres type
    /// (information_schema spelling).
    pub fn from_pg_type(pg_type: &str) -> Self {
        match pg_type {
            "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision" => {
                AttrDataType::Numeric
            }
            "boolean" => AttrDataType::Boolean,
            t if t.starts_with("timestamp") => AttrDataType::Timestamptz,
            "json" | "jsonb" => AttrDataType::Jsonb,
            _ => AttrDataType::String,
        }
    }
}

/// An attribute definition keyed by `(entity_type_id, name, data_type)`.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub entity_type_id: i16,
    pub name: String,
    pub data_type: AttrDataType,
    pub description: Option<String>,
}

impl AttributeDef {
    fn entity_type_name(&self) -> &'static str {
        match self.entity_type_id {
            schema::ENTITY_TYPE_SALES_BATCH => "sales_batch",
            schema::ENTITY_TYPE_TRANSACTION => "transaction",
            schema::ENTITY_TYPE_LINE_ITEM => "line_item",
            schema::ENTITY_TYPE_ADDRESS => "address",
            _ => "unknown",
        }
    }

    /// Deterministic attribute id under the attribute namespace.
    pub fn derived_id(&self) -> Uuid {
        ids::attribute_id(self.entity_type_name(), &self.name, self.data_type.as_str())
    }
}

/// One EAV row; exactly one value column is populated to match the
/// attribute's data type (all-NULL when a cast failed).
#[derive(Debug, Clone, Default)]
pub struct EavValue {
    pub entity_id: Uuid,
    pub attribute_id: Uuid,
    pub string: Option<String>,
    pub numeric: Option<BigDecimal>,
    pub boolean: Option<bool>,
    pub ts: Option<DateTime<Utc>>,
    pub jsonb: Option<Value>,
}

impl EavValue {
    pub fn string(entity_id: Uuid, attribute_id: Uuid, v: impl Into<String>) -> Self {
        Self {
            entity_id,
            attribute_id,
            string: Some(v.into()),
            ..Default::default()
        }
    }
}

/// Rows per EAV upsert statement, sized against the bind-parameter cap
/// with headroom for the seven binds per row.
pub fn eav_batch_size() -> usize {
    (MAX_BIND_PARAMS / 7).saturating_sub(1000).max(1)
}

/// Insert entities with conflict-do-nothing; `(id, entity_type_id, parent)`.
pub async fn insert_entities(
    conn: &mut PgConnection,
    rows: &[(Uuid, i16, Option<Uuid>)],
) -> Result<()> {
    for batch in rows.chunks((MAX_BIND_PARAMS / 3).max(1)) {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO sales.entities (id, entity_type_id, parent_entity_id) ",
        );
        qb.push_values(batch, |mut b, (id, type_id, parent)| {
            b.push_bind(id).push_bind(type_id).push_bind(parent);
        });
        qb.push(" ON CONFLICT (id) DO NOTHING");
        qb.build().persistent(false).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Create any missing attribute definitions and return the id for each
/// `(entity_type_id, name, data_type)` key, reading back after the insert
/// so pre-existing definitions keep their historical ids.
pub async fn ensure_attributes(
    conn: &mut PgConnection,
    defs: &[AttributeDef],
) -> Result<HashMap<(i16, String, AttrDataType), Uuid>> {
    if defs.is_empty() {
        return Ok(HashMap::new());
    }
    for batch in defs.chunks((MAX_BIND_PARAMS / 5).max(1)) {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO sales.attributes (id, entity_type_id, name, data_type, description) ",
        );
        qb.push_values(batch, |mut b, def| {
            b.push_bind(def.derived_id())
                .push_bind(def.entity_type_id)
                .push_bind(&def.name)
                .push_bind(def.data_type.as_str())
                .push_unseparated("::sales.attr_data_type")
                .push_bind(&def.description);
        });
        qb.push(" ON CONFLICT (entity_type_id, name, data_type) DO NOTHING");
        qb.build().persistent(false).execute(&mut *conn).await?;
    }

    let mut out = HashMap::with_capacity(defs.len());
    let type_ids: Vec<i16> = defs.iter().map(|d| d.entity_type_id).collect();
    let names: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();
    let dts: Vec<String> = defs.iter().map(|d| d.data_type.as_str().to_string()).collect();
    let rows = sqlx::query(
        "SELECT a.id, a.entity_type_id, a.name, a.data_type::text
         FROM sales.attributes a
         JOIN UNNEST($1::smallint[], $2::text[], $3::text[]) AS k(entity_type_id, name, data_type)
           ON a.entity_type_id = k.entity_type_id
          AND a.name = k.name
          AND a.data_type = k.data_type::sales.attr_data_type",
    )
    .persistent(false)
    .bind(&type_ids)
    .bind(&names)
    .bind(&dts)
    .fetch_all(&mut *conn)
    .await?;
    for r in rows {
        let id: Uuid = r.get(0);
        let type_id: i16 = r.get(1);
        let name: String = r.get(2);
        let dt: String = r.get(3);
        let dt = match dt.as_str() {
            "numeric" => AttrDataType::Numeric,
            "boolean" => AttrDataType::Boolean,
            "timestamptz" => AttrDataType::Timestamptz,
            "jsonb" => AttrDataType::Jsonb,
            _ => AttrDataType::String,
        };
        out.insert((type_id, name, dt), id);
    }
    Ok(out)
}

/// Batched EAV upsert; conflict on the `(entity_id, attribute_id)` key
/// replaces every value column so replays converge.
pub async fn upsert_eav(conn: &mut PgConnection, rows: &[EavValue]) -> Result<u64> {
    let mut total = 0u64;
    for batch in rows.chunks(eav_batch_size()) {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO sales.entity_attribute_values \
             (entity_id, attribute_id, value_string, value_numeric, value_boolean, value_ts, value_jsonb) ",
        );
        qb.push_values(batch, |mut b, v| {
            b.push_bind(v.entity_id)
                .push_bind(v.attribute_id)
                .push_bind(&v.string)
                .push_bind(&v.numeric)
                .push_bind(&v.boolean)
                .push_bind(v.ts)
                .push_bind(&v.jsonb);
        });
        qb.push(
            " ON CONFLICT (entity_id, attribute_id) DO UPDATE SET \
               value_string = EXCLUDED.value_string, \
               value_numeric = EXCLUDED.value_numeric, \
               value_boolean = EXCLUDED.value_boolean, \
               value_ts = EXCLUDED.value_ts, \
               value_jsonb = EXCLUDED.value_jsonb",
        );
        let done = qb.build().persistent(false).execute(&mut *conn).await?;
        total += done.rows_affected();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_type_mapping_covers_the_table() {
        assert_eq!(AttrDataType::from_pg_type("text"), AttrDataType::String);
        assert_eq!(
            AttrDataType::from_pg_type("character varying"),
            AttrDataType::String
        );
        assert_eq!(AttrDataType::from_pg_type("bigint"), AttrDataType::Numeric);
        assert_eq!(
            AttrDataType::from_pg_type("double precision"),
            AttrDataType::Numeric
        );
        assert_eq!(AttrDataType::from_pg_type("boolean"), AttrDataType::Boolean);
        assert_eq!(
            AttrDataType::from_pg_type("timestamp with time zone"),
            AttrDataType::Timestamptz
        );
        assert_eq!(
            AttrDataType::from_pg_type("timestamp without time zone"),
            AttrDataType::Timestamptz
        );
        assert_eq!(AttrDataType::from_pg_type("jsonb"), AttrDataType::Jsonb);
        assert_eq!(AttrDataType::from_pg_type("uuid"), AttrDataType::String);
    }

    #[test]
    fn attribute_ids_are_stable_per_identity() {
        let a = AttributeDef {
            entity_type_id: schema::ENTITY_TYPE_LINE_ITEM,
            name: "sku".into(),
            data_type: AttrDataType::String,
            description: None,
        };
        let b = AttributeDef {
            description: Some("anything".into()),
            ..a.clone()
        };
        assert_eq!(a.derived_id(), b.derived_id());

        let other_type = AttributeDef {
            data_type: AttrDataType::Numeric,
            ..a.clone()
        };
        assert_ne!(a.derived_id(), other_type.derived_id());
    }

    #[test]
    fn eav_batches_stay_under_the_param_cap() {
        assert!(eav_batch_size() * 7 <= MAX_BIND_PARAMS);
        assert!(eav_batch_size() >= 1);
    }
}
