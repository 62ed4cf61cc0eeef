use crate::{
    error::Result,
    history::{CallRecordUpdate, NewCallRecord},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Credential grant returned by `GET /api/token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub identity: String,
    pub token: String,
    /// Seconds until the token expires.
    pub ttl: u64,
}

/// One row of the remote call-history store, as listed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecordRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    pub number: String,
    pub name: Option<String>,
    pub direction: String,
    pub status: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// JSON client over the external backend HTTP surface. The backend itself is
/// an external collaborator; this client is a plain passthrough with no retry.
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Url::parse(base_url).map_err(|e| anyhow!("invalid backend url {}: {}", base_url, e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn fetch_token(&self) -> Result<TokenGrant> {
        let grant = self
            .client
            .get(self.endpoint("/api/token"))
            .send()
            .await?
            .error_for_status()?
            .json::<TokenGrant>()
            .await?;
        debug!(identity = %grant.identity, ttl = grant.ttl, "fetched credential");
        Ok(grant)
    }

    pub async fn create_call_record(&self, record: &NewCallRecord) -> Result<()> {
        self.client
            .post(self.endpoint("/api/call-history"))
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn update_call_record(&self, update: &CallRecordUpdate) -> Result<()> {
        self.client
            .post(self.endpoint("/api/update-call-history"))
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn list_call_history(&self) -> Result<Vec<CallRecordRow>> {
        let rows = self
            .client
            .get(self.endpoint("/api/call-history"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    pub async fn fetch_contacts(&self) -> Result<HashMap<String, String>> {
        let contacts = self
            .client
            .get(self.endpoint("/api/contacts"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(contacts)
    }

    pub async fn save_contact(&self, number: &str, name: &str) -> Result<()> {
        self.client
            .post(self.endpoint("/api/contacts"))
            .json(&serde_json::json!({ "number": number, "name": name }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn delete_contact(&self, number: &str) -> Result<()> {
        self.client
            .delete(self.endpoint("/api/contacts"))
            .json(&serde_json::json!({ "number": number }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Available outbound caller-id options, keyed by region label. Values may
    /// be null when a region has no registered number.
    pub async fn fetch_caller_ids(&self) -> Result<HashMap<String, Option<String>>> {
        let ids = self
            .client
            .get(self.endpoint("/api/caller-ids"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ids)
    }
}
