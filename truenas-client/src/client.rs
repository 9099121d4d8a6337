//! HTTP implementation of [`Appliance`] on top of reqwest.
//!
//! Reads are retried with exponential backoff on transient failures.
//! Mutations are sent exactly once; the caller retries the whole
//! (idempotent) operation instead.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::api::Appliance;
use crate::error::{ApiError, Result};
use crate::types::{
    CreateDatasetParams, CreateIscsiExtentParams, CreateIscsiInitiatorParams,
    CreateIscsiTargetExtentParams, CreateIscsiTargetParams, CreateNfsShareParams, Dataset,
    DeleteIscsiExtentParams, IscsiExtent, IscsiGlobalConfig, IscsiInitiator, IscsiPortal,
    IscsiTarget, IscsiTargetExtent, NfsShare,
};

/// Required suffix of the configured base URL
pub const API_PATH_SUFFIX: &str = "api/v2.0";

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`TrueNasClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `https://nas.local/api/v2.0`
    pub base_url: String,
    /// API key, sent as a bearer token
    pub token: String,
    pub insecure_skip_tls_verify: bool,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            insecure_skip_tls_verify: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrueNasClient {
    http: Client,
    base_url: String,
    token: String,
}

/// Check that `base_url` parses and points at the v2.0 API root.
///
/// Returns the URL with any trailing slash removed.
pub fn validate_base_url(base_url: &str) -> Result<String> {
    let parsed = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    if !parsed.path().trim_end_matches('/').ends_with(API_PATH_SUFFIX) {
        return Err(ApiError::InvalidUrl {
            url: base_url.to_string(),
            reason: format!("base URL should end with \"{}\"", API_PATH_SUFFIX),
        });
    }

    Ok(base_url.trim_end_matches('/').to_string())
}

/// Everything but RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode an identifier for use as a single path segment.
///
/// Dataset ids contain `/`, which the API expects as `%2F`.
pub fn encode_id(id: &str) -> String {
    utf8_percent_encode(id, PATH_SEGMENT).to_string()
}

/// Execute an async operation with exponential backoff retry.
async fn with_retry<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;

                if !error.is_retryable() || attempt > MAX_RETRIES {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "Appliance request failed after retries"
                        );
                    }
                    return Err(error);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    error = %error,
                    backoff_ms = backoff_ms,
                    "Retryable appliance error, backing off"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

impl TrueNasClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = validate_base_url(&config.base_url)?;

        if config.insecure_skip_tls_verify {
            warn!(base_url = %base_url, "TLS certificate verification disabled for appliance API");
        }

        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            token: config.token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, path = %path, "Appliance API request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        // Some deletes answer with an empty body
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        with_retry(path, || self.send::<T, ()>(Method::GET, path, None)).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn delete<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<()> {
        let _: serde_json::Value = self.send(Method::DELETE, path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl Appliance for TrueNasClient {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.get("/pool/dataset").await
    }

    async fn get_dataset(&self, id: &str) -> Result<Dataset> {
        self.get(&format!("/pool/dataset/id/{}", encode_id(id))).await
    }

    async fn create_dataset(&self, params: &CreateDatasetParams) -> Result<Dataset> {
        self.post("/pool/dataset", params).await
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        self.delete::<()>(&format!("/pool/dataset/id/{}", encode_id(id)), None)
            .await
    }

    async fn list_nfs_shares(&self) -> Result<Vec<NfsShare>> {
        self.get("/sharing/nfs").await
    }

    async fn create_nfs_share(&self, params: &CreateNfsShareParams) -> Result<NfsShare> {
        self.post("/sharing/nfs", params).await
    }

    async fn list_iscsi_extents(&self) -> Result<Vec<IscsiExtent>> {
        self.get("/iscsi/extent").await
    }

    async fn create_iscsi_extent(&self, params: &CreateIscsiExtentParams) -> Result<IscsiExtent> {
        self.post("/iscsi/extent", params).await
    }

    async fn delete_iscsi_extent(&self, id: i64) -> Result<()> {
        let body = DeleteIscsiExtentParams {
            remove: true,
            force: true,
        };
        self.delete(&format!("/iscsi/extent/id/{}", id), Some(&body))
            .await
    }

    async fn list_iscsi_initiators(&self) -> Result<Vec<IscsiInitiator>> {
        self.get("/iscsi/initiator").await
    }

    async fn create_iscsi_initiator(
        &self,
        params: &CreateIscsiInitiatorParams,
    ) -> Result<IscsiInitiator> {
        self.post("/iscsi/initiator", params).await
    }

    async fn delete_iscsi_initiator(&self, id: i64) -> Result<()> {
        self.delete::<()>(&format!("/iscsi/initiator/id/{}", id), None)
            .await
    }

    async fn list_iscsi_targets(&self) -> Result<Vec<IscsiTarget>> {
        self.get("/iscsi/target").await
    }

    async fn create_iscsi_target(&self, params: &CreateIscsiTargetParams) -> Result<IscsiTarget> {
        self.post("/iscsi/target", params).await
    }

    async fn delete_iscsi_target(&self, id: i64) -> Result<()> {
        // Body is the `force` flag
        self.delete(&format!("/iscsi/target/id/{}", id), Some(&true))
            .await
    }

    async fn list_iscsi_target_extents(&self) -> Result<Vec<IscsiTargetExtent>> {
        self.get("/iscsi/targetextent").await
    }

    async fn create_iscsi_target_extent(
        &self,
        params: &CreateIscsiTargetExtentParams,
    ) -> Result<IscsiTargetExtent> {
        self.post("/iscsi/targetextent", params).await
    }

    async fn get_iscsi_global_config(&self) -> Result<IscsiGlobalConfig> {
        self.get("/iscsi/global").await
    }

    async fn get_iscsi_portal(&self, id: i64) -> Result<IscsiPortal> {
        self.get(&format!("/iscsi/portal/id/{}", id)).await
    }
}
