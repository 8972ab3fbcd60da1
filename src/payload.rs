//! Caller payload: shape, validation, and the settings object every
//! pipeline activity receives.
//!
//! Activities must be deterministic in their inputs, so everything they
//! need (field mappings, upload metadata, staging table name, tuning) is
//! carried in [`IngestSettings`] rather than read from the environment or a
//! clock mid-flight.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Address scope selector; keys of the `fields` payload section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Billing,
    Shipping,
}

impl AddressScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressScope::Billing => "billing",
            AddressScope::Shipping => "shipping",
        }
    }

    /// Name of the derived staging column that carries this scope's ids.
    pub fn id_column(&self) -> &'static str {
        match self {
            AddressScope::Billing => "billing_address_id",
            AddressScope::Shipping => "shipping_address_id",
        }
    }
}

/// Logical address components a scope map may bind to staging columns.
pub const ADDRESS_COMPONENTS: [&str; 5] = ["street", "addr2", "city", "state", "zipcode"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFields {
    pub order_num: String,
    pub sale_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    /// component name -> staging column header
    pub billing: BTreeMap<String, String>,
    pub shipping: BTreeMap<String, String>,
    pub order_info: OrderFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub tenant_id: String,
    pub upload_id: Uuid,
    pub uploader: String,
    pub upload_timestamp: String,
    /// Anything else the caller sent along; flattened into sales_batch EAV.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    pub fields: FieldMap,
    pub metadata: UploadMetadata,
}

impl UploadPayload {
    pub fn from_json(raw: &str) -> Result<Self> {
        let payload: UploadPayload =
            serde_json::from_str(raw).context("malformed ingest payload")?;
        payload.validate()?;
        Ok(payload)
    }

    /// Reject payloads the starter would answer 400 to: every subsection
    /// and the two order fields must be present and non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.fields.billing.is_empty() {
            bail!("fields.billing must be present and non-empty");
        }
        if self.fields.shipping.is_empty() {
            bail!("fields.shipping must be present and non-empty");
        }
        if self.fields.order_info.order_num.trim().is_empty() {
            bail!("fields.order_info.order_num must be non-empty");
        }
        if self.fields.order_info.sale_date.trim().is_empty() {
            bail!("fields.order_info.sale_date must be non-empty");
        }
        if self.metadata.tenant_id.trim().is_empty() {
            bail!("metadata.tenant_id must be non-empty");
        }
        if self.metadata.uploader.trim().is_empty() {
            bail!("metadata.uploader must be non-empty");
        }
        if self.metadata.upload_timestamp.trim().is_empty() {
            bail!("metadata.upload_timestamp must be non-empty");
        }
        for (scope, map) in [("billing", &self.fields.billing), ("shipping", &self.fields.shipping)]
        {
            for (component, header) in map {
                if !ADDRESS_COMPONENTS.contains(&component.as_str()) {
                    bail!("fields.{scope}.{component} is not a known address component");
                }
                if header.trim().is_empty() {
                    bail!("fields.{scope}.{component} maps to an empty column header");
                }
            }
        }
        Ok(())
    }

    pub fn scope_map(&self, scope: AddressScope) -> &BTreeMap<String, String> {
        match scope {
            AddressScope::Billing => &self.fields.billing,
            AddressScope::Shipping => &self.fields.shipping,
        }
    }

    /// Columns the type inferencer must leave as text: zips keep leading
    /// zeros, the sale date is cast later by the transform.
    pub fn inference_exempt_columns(&self) -> Vec<String> {
        let mut cols = vec![self.fields.order_info.sale_date.clone()];
        for scope in [AddressScope::Billing, AddressScope::Shipping] {
            if let Some(zip) = self.scope_map(scope).get("zipcode") {
                cols.push(zip.clone());
            }
        }
        cols.sort();
        cols.dedup();
        cols
    }
}

/// Flatten the payload for sales_batch metadata EAV. Keys nested under
/// `billing`/`shipping` keep their section prefix (the two sections share
/// component names); every other parent key is collapsed to the leaf.
pub fn flatten_for_metadata(value: &Value) -> BTreeMap<String, String> {
    fn scalar_to_string(v: &Value) -> Option<String> {
        match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }

    fn walk(out: &mut BTreeMap<String, String>, prefix: Option<&str>, value: &Value) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    match v {
                        Value::Object(_) => {
                            let next = if k == "billing" || k == "shipping" {
                                Some(k.as_str())
                            } else {
                                None
                            };
                            walk(out, next, v);
                        }
                        _ => {
                            let key = match prefix {
                                Some(p) => format!("{p}_{k}"),
                                None => k.clone(),
                            };
                            if let Some(s) = scalar_to_string(v) {
                                out.insert(key, s);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = BTreeMap::new();
    walk(&mut out, None, value);
    out
}

/// Everything a pipeline activity needs; identical across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    pub payload: UploadPayload,
    /// Per-upload staging table name inside the `sales` schema.
    pub staging_table: String,
    pub target_rows_per_chunk: i64,
}

impl IngestSettings {
    pub const DEFAULT_TARGET_ROWS_PER_CHUNK: i64 = 50_000;

    pub fn new(payload: UploadPayload, staging_table: String) -> Result<Self> {
        if staging_table.trim().is_empty() {
            bail!("staging_table must be non-empty");
        }
        if !staging_table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("staging_table may only contain [A-Za-z0-9_]: {staging_table}");
        }
        Ok(Self {
            payload,
            staging_table,
            target_rows_per_chunk: Self::DEFAULT_TARGET_ROWS_PER_CHUNK,
        })
    }

    pub fn with_target_rows_per_chunk(mut self, target: i64) -> Self {
        self.target_rows_per_chunk = target.max(1);
        self
    }

    pub fn upload_id(&self) -> Uuid {
        self.payload.metadata.upload_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.payload.metadata.tenant_id
    }

    pub fn order_num_column(&self) -> &str {
        &self.payload.fields.order_info.order_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "fields": {
                "billing": {
                    "street": "bill_street", "addr2": "bill_addr2",
                    "city": "bill_city", "state": "bill_state", "zipcode": "bill_zip"
                },
                "shipping": {
                    "street": "ship_street", "city": "ship_city",
                    "state": "ship_state", "zipcode": "ship_zip"
                },
                "order_info": { "order_num": "order_num", "sale_date": "sale_date" }
            },
            "metadata": {
                "tenant_id": "acme",
                "upload_id": "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11",
                "uploader": "jsmith",
                "upload_timestamp": "2026-01-05T10:00:00Z"
            }
        })
    }

    #[test]
    fn accepts_well_formed_payload() {
        let payload = UploadPayload::from_json(&sample_payload().to_string()).unwrap();
        assert_eq!(payload.metadata.tenant_id, "acme");
        assert_eq!(payload.fields.order_info.order_num, "order_num");
    }

    #[test]
    fn rejects_missing_order_fields() {
        let mut raw = sample_payload();
        raw["fields"]["order_info"]["order_num"] = json!("  ");
        assert!(UploadPayload::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn rejects_empty_scope_section() {
        let mut raw = sample_payload();
        raw["fields"]["shipping"] = json!({});
        assert!(UploadPayload::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn rejects_unknown_address_component() {
        let mut raw = sample_payload();
        raw["fields"]["billing"]["county"] = json!("bill_county");
        assert!(UploadPayload::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn exempt_columns_cover_zips_and_sale_date() {
        let payload = UploadPayload::from_json(&sample_payload().to_string()).unwrap();
        let cols = payload.inference_exempt_columns();
        assert_eq!(cols, vec!["bill_zip", "sale_date", "ship_zip"]);
    }

    #[test]
    fn flatten_keeps_scope_prefixes_and_collapses_other_nesting() {
        let raw = json!({
            "billing": { "street": "bill_street", "zipcode": "bill_zip" },
            "shipping": { "street": "ship_street" },
            "order_info": { "order_num": "order_num" },
            "tenant_id": "acme",
            "nested": { "deep": { "leaf": "v" } }
        });
        let flat = flatten_for_metadata(&raw);
        assert_eq!(flat.get("billing_street").unwrap(), "bill_street");
        assert_eq!(flat.get("billing_zipcode").unwrap(), "bill_zip");
        assert_eq!(flat.get("shipping_street").unwrap(), "ship_street");
        assert_eq!(flat.get("order_num").unwrap(), "order_num");
        assert_eq!(flat.get("tenant_id").unwrap(), "acme");
        assert_eq!(flat.get("leaf").unwrap(), "v");
        assert!(!flat.contains_key("billing"));
    }

    #[test]
    fn staging_table_names_are_restricted() {
        let payload = UploadPayload::from_json(&sample_payload().to_string()).unwrap();
        assert!(IngestSettings::new(payload.clone(), "upload_123".into()).is_ok());
        assert!(IngestSettings::new(payload.clone(), "bad; drop".into()).is_err());
        assert!(IngestSettings::new(payload, "".into()).is_err());
    }
}
