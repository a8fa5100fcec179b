//! The analytics record wire type and the validation/enrichment applied to
//! every record before it is handed to a [`crate::bucket::Bucket`].

use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;

const NINETY_DAYS_MS: i64 = 90 * 24 * 60 * 60 * 1000;
const SENTINEL_RECORD_TYPE: &str = "APIAnalytics";

/// One API call's timing and identity data, ready to be serialized by an
/// uploader. Field names on the wire are lower-snake-case except
/// `recordType`, which callers of the upstream collector expect verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub client_received_start: i64,
    pub client_received_end: i64,
    pub client_sent_start: i64,
    pub client_sent_end: i64,
    pub target_received_start: i64,
    pub target_received_end: i64,
    pub target_sent_start: i64,
    pub target_sent_end: i64,
    pub api_proxy: String,
    pub request_uri: String,
    pub request_path: String,
    pub request_verb: String,
    pub client_ip: String,
    pub user_agent: String,
    pub api_proxy_revision: String,
    pub response_status_code: i32,
    pub developer_email: String,
    pub developer_app: String,
    pub access_token: String,
    pub client_id: String,
    pub api_product: String,
    pub organization: String,
    pub environment: String,
    pub gateway_source: String,
    #[serde(rename = "recordType")]
    pub record_type: String,
}

/// Every field that failed validation, in the order the checks ran.
#[derive(Debug, thiserror::Error)]
#[error("invalid record: {}", .0.join(", "))]
pub struct ValidationError(pub Vec<String>);

impl Record {
    /// Stamps tenancy and identity fields from `auth`, overwriting whatever
    /// the caller set, and forces `record_type` to the sentinel value. Mirrors
    /// the upstream collector, which never trusts caller-supplied identity.
    pub fn ensure_fields(mut self, auth: &dyn AuthContext) -> Record {
        self.organization = auth.organization().to_owned();
        self.environment = auth.environment().to_owned();
        self.developer_email = auth.developer_email().to_owned();
        self.developer_app = auth.application().to_owned();
        self.access_token = auth.access_token().to_owned();
        self.client_id = auth.client_id().to_owned();
        self.api_product = auth.api_products().first().cloned().unwrap_or_default();
        self.record_type = SENTINEL_RECORD_TYPE.to_owned();
        self
    }

    /// Checks the invariants the upstream collector enforces before a record
    /// is allowed into a bucket. Returns every failing field at once rather
    /// than stopping at the first.
    pub fn validate(&self, now_unix_millis: i64) -> Result<(), ValidationError> {
        let mut failures = Vec::new();

        if self.organization.is_empty() {
            failures.push("organization".to_owned());
        }
        if self.environment.is_empty() {
            failures.push("environment".to_owned());
        }
        if self.client_received_start == 0 {
            failures.push("client_received_start".to_owned());
        }
        if self.client_received_end == 0 {
            failures.push("client_received_end".to_owned());
        }
        if self.client_received_start != 0
            && self.client_received_end != 0
            && self.client_received_start > self.client_received_end
        {
            failures.push("client_received_start after client_received_end".to_owned());
        }
        if self.client_received_start > now_unix_millis {
            failures.push("client_received_start in the future".to_owned());
        }
        if self.client_received_start != 0 && self.client_received_start < now_unix_millis - NINETY_DAYS_MS {
            failures.push("client_received_start older than 90 days".to_owned());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(failures))
        }
    }
}

/// Computes the tenant key used for temp/staging paths and the bucket map.
pub fn tenant_key(organization: &str, environment: &str) -> String {
    format!("{organization}~{environment}")
}
