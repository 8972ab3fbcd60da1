//! External batch address validation.
//!
//! The provider is an opaque batch endpoint: we post raw tuples, it answers
//! canonical records (or null for tuples it cannot resolve), aligned by
//! index. The trait keeps the pipeline testable without the vendor.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::env as env_util;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        // back off to a char boundary; the body is arbitrary provider text
        let cut = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= max_len)
            .last()
            .unwrap_or(0);
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// One raw tuple from staging; only configured components are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawAddress {
    pub street: Option<String>,
    pub addr2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zipcode: Option<String>,
}

impl RawAddress {
    pub fn component(&self, name: &str) -> Option<&str> {
        match name {
            "street" => self.street.as_deref(),
            "addr2" => self.addr2.as_deref(),
            "city" => self.city.as_deref(),
            "state" => self.state.as_deref(),
            "zipcode" => self.zipcode.as_deref(),
            _ => None,
        }
    }

    pub fn set_component(&mut self, name: &str, value: Option<String>) {
        match name {
            "street" => self.street = value,
            "addr2" => self.addr2 = value,
            "city" => self.city = value,
            "state" => self.state = value,
            "zipcode" => self.zipcode = value,
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.street, &self.addr2, &self.city, &self.state, &self.zipcode]
            .iter()
            .all(|c| c.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Canonical fields the validator answers with; these become the address
/// entity's EAV values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalAddress {
    pub delivery_line_1: String,
    #[serde(default)]
    pub delivery_line_2: Option<String>,
    pub city_name: String,
    pub state_abbreviation: String,
    pub zipcode: String,
    #[serde(default)]
    pub plus4_code: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub carrier_route: Option<String>,
    #[serde(default)]
    pub rdi: Option<String>,
    #[serde(default)]
    pub county_name: Option<String>,
}

#[async_trait]
pub trait AddressValidator: Send + Sync {
    /// Validate a slice of raw tuples; the result aligns with the input by
    /// index, `None` where the provider could not resolve a tuple.
    async fn validate_batch(&self, batch: &[RawAddress]) -> Result<Vec<Option<CanonicalAddress>>>;
}

/// HTTP client for the batch endpoint.
#[derive(Debug, Clone)]
pub struct HttpAddressValidator {
    base_url: String,
    http: Client,
    token: Option<String>,
}

impl HttpAddressValidator {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build address validator client")?;
        Ok(Self {
            base_url,
            http,
            token,
        })
    }

    /// `ADDRESS_VALIDATOR_URL` (required) + `ADDRESS_VALIDATOR_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let base_url = env_util::env_req("ADDRESS_VALIDATOR_URL")?;
        Self::new(base_url, env_util::env_opt("ADDRESS_VALIDATOR_TOKEN"))
    }
}

#[async_trait]
impl AddressValidator for HttpAddressValidator {
    async fn validate_batch(&self, batch: &[RawAddress]) -> Result<Vec<Option<CanonicalAddress>>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut req = self.http.post(&self.base_url).json(batch);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .context("address validator request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "address validator returned {status}: {}",
                truncate_for_log(body, 512)
            ));
        }
        let records: Vec<Option<CanonicalAddress>> = resp
            .json()
            .await
            .context("address validator returned malformed JSON")?;
        if records.len() != batch.len() {
            return Err(anyhow!(
                "address validator answered {} records for {} inputs",
                records.len(),
                batch.len()
            ));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tuples_are_detected() {
        assert!(RawAddress::default().is_empty());
        assert!(RawAddress {
            street: Some("   ".into()),
            ..Default::default()
        }
        .is_empty());
        assert!(!RawAddress {
            city: Some("Springfield".into()),
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "日".repeat(200); // 600 bytes of 3-byte chars; 512 is mid-char
        let out = truncate_for_log(body, 512);
        assert!(out.ends_with('…'));
        assert!(out.len() <= 512 + '…'.len_utf8());

        let short = truncate_for_log("ok".into(), 512);
        assert_eq!(short, "ok");
    }
}
