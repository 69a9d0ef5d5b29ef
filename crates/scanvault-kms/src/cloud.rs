use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::provider::{binding, open, random_key, seal, KeyManagementProvider, KmsError, KEY_LEN};

/// Operations a managed key may permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperation {
    Wrap,
    Unwrap,
}

/// Policy a managed key reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub key_ref: String,
    pub enabled: bool,
    #[serde(default)]
    pub allowed_operations: Vec<KeyOperation>,
}

impl KeyPolicy {
    pub fn permits(&self, op: KeyOperation) -> bool {
        self.enabled && self.allowed_operations.contains(&op)
    }
}

/// Transport to a managed key service. The KEK never leaves the service.
#[async_trait]
pub trait KeyServiceClient: Send + Sync {
    async fn describe_key(&self, key_ref: &str) -> Result<KeyPolicy, KmsError>;

    async fn wrap(&self, key_ref: &str, plaintext: &[u8], context: &[u8])
        -> Result<Vec<u8>, KmsError>;

    async fn unwrap(
        &self,
        key_ref: &str,
        ciphertext: &[u8],
        context: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}

/// HTTP key service client. Every request carries the bearer token.
pub struct HttpKeyServiceClient {
    endpoint: String,
    token: Zeroizing<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WrapResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    plaintext: String,
}

impl HttpKeyServiceClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self, KmsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| KmsError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: Zeroizing::new(token.into()),
            client,
        })
    }

    fn headers(&self) -> Result<HeaderMap, KmsError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("scanvault"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.token.as_str()))
            .map_err(|e| KmsError::Configuration(format!("invalid key service token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    fn key_url(&self, key_ref: &str) -> String {
        format!("{}/v1/keys/{key_ref}", self.endpoint)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, KmsError> {
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp)?;
        resp.json()
            .await
            .map_err(|e| KmsError::Decode(format!("key service response: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> KmsError {
    KmsError::Unavailable(err.to_string())
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, KmsError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            KmsError::Configuration(format!("key service refused request: {status}"))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            KmsError::Integrity(format!("key service rejected ciphertext: {status}"))
        }
        _ => KmsError::Unavailable(format!("key service returned {status}")),
    })
}

fn decode_b64(value: &str) -> Result<Vec<u8>, KmsError> {
    BASE64
        .decode(value)
        .map_err(|e| KmsError::Decode(format!("key service payload: {e}")))
}

#[async_trait]
impl KeyServiceClient for HttpKeyServiceClient {
    #[instrument(skip_all, fields(key_ref = %key_ref))]
    async fn describe_key(&self, key_ref: &str) -> Result<KeyPolicy, KmsError> {
        let resp = self
            .client
            .get(self.key_url(key_ref))
            .headers(self.headers()?)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp)?
            .json()
            .await
            .map_err(|e| KmsError::Decode(format!("key policy: {e}")))
    }

    #[instrument(skip_all, fields(key_ref = %key_ref))]
    async fn wrap(
        &self,
        key_ref: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let body = json!({
            "plaintext": BASE64.encode(plaintext),
            "context": BASE64.encode(context),
        });
        let resp: WrapResponse = self
            .post(format!("{}/wrap", self.key_url(key_ref)), body)
            .await?;
        decode_b64(&resp.ciphertext)
    }

    #[instrument(skip_all, fields(key_ref = %key_ref))]
    async fn unwrap(
        &self,
        key_ref: &str,
        ciphertext: &[u8],
        context: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let body = json!({
            "ciphertext": BASE64.encode(ciphertext),
            "context": BASE64.encode(context),
        });
        let resp: UnwrapResponse = self
            .post(format!("{}/unwrap", self.key_url(key_ref)), body)
            .await?;
        let resp = Zeroizing::new(resp.plaintext);
        decode_b64(&resp).map(Zeroizing::new)
    }
}

/// Provider backed by a managed key service.
pub struct CloudKeyProvider {
    client: Box<dyn KeyServiceClient>,
    key_ref: String,
}

impl CloudKeyProvider {
    /// Verify the key exists and permits wrap and unwrap. Any failure here is
    /// a configuration error: the service must not be silently skipped.
    #[instrument(skip_all, fields(key_ref = tracing::field::Empty))]
    pub async fn connect(
        client: Box<dyn KeyServiceClient>,
        key_ref: impl Into<String>,
    ) -> Result<Self, KmsError> {
        let key_ref = key_ref.into();
        tracing::Span::current().record("key_ref", key_ref.as_str());
        let policy = client.describe_key(&key_ref).await.map_err(|e| {
            KmsError::Configuration(format!("cannot verify key {key_ref}: {e}"))
        })?;
        if !policy.enabled {
            return Err(KmsError::Configuration(format!("key {key_ref} is disabled")));
        }
        for op in [KeyOperation::Wrap, KeyOperation::Unwrap] {
            if !policy.permits(op) {
                return Err(KmsError::Configuration(format!(
                    "key {key_ref} policy does not allow {op:?}"
                )));
            }
        }
        info!("key service policy verified");
        Ok(Self { client, key_ref })
    }
}

#[async_trait]
impl KeyManagementProvider for CloudKeyProvider {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn key_ref(&self) -> Option<String> {
        Some(self.key_ref.clone())
    }

    async fn encrypt_dek(
        &self,
        plaintext_key: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        self.client
            .wrap(&self.key_ref, plaintext_key, &binding(key_id, aad))
            .await
    }

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        self.client
            .unwrap(&self.key_ref, ciphertext, &binding(key_id, aad))
            .await
    }

    async fn is_available(&self) -> bool {
        match self.client.describe_key(&self.key_ref).await {
            Ok(policy) => policy.enabled,
            Err(err) => {
                warn!(error = %err, "key service health check failed");
                false
            }
        }
    }
}

/// In-process key service used by tests and local development. Holds a
/// random KEK and can be switched off to simulate an outage.
pub struct InMemoryKeyService {
    kek: Zeroizing<[u8; KEY_LEN]>,
    policy: KeyPolicy,
    available: AtomicBool,
}

impl InMemoryKeyService {
    pub fn new(key_ref: impl Into<String>) -> Self {
        Self::with_policy(KeyPolicy {
            key_ref: key_ref.into(),
            enabled: true,
            allowed_operations: vec![KeyOperation::Wrap, KeyOperation::Unwrap],
        })
    }

    pub fn with_policy(policy: KeyPolicy) -> Self {
        Self {
            kek: random_key(),
            policy,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure(&self, key_ref: &str) -> Result<(), KmsError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KmsError::Unavailable("in-memory key service offline".into()));
        }
        if key_ref != self.policy.key_ref {
            return Err(KmsError::Configuration(format!("unknown key {key_ref}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyServiceClient for InMemoryKeyService {
    async fn describe_key(&self, key_ref: &str) -> Result<KeyPolicy, KmsError> {
        self.ensure(key_ref)?;
        Ok(self.policy.clone())
    }

    async fn wrap(
        &self,
        key_ref: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        self.ensure(key_ref)?;
        seal(&self.kek, plaintext, context)
    }

    async fn unwrap(
        &self,
        key_ref: &str,
        ciphertext: &[u8],
        context: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        self.ensure(key_ref)?;
        open(&self.kek, ciphertext, context)
    }
}

#[async_trait]
impl<T: KeyServiceClient + ?Sized> KeyServiceClient for std::sync::Arc<T> {
    async fn describe_key(&self, key_ref: &str) -> Result<KeyPolicy, KmsError> {
        (**self).describe_key(key_ref).await
    }

    async fn wrap(
        &self,
        key_ref: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        (**self).wrap(key_ref, plaintext, context).await
    }

    async fn unwrap(
        &self,
        key_ref: &str,
        ciphertext: &[u8],
        context: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        (**self).unwrap(key_ref, ciphertext, context).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn connect_accepts_owned_and_borrowed_key_refs() {
        let service = Arc::new(InMemoryKeyService::new("kek-1"));
        let owned = CloudKeyProvider::connect(Box::new(service.clone()), String::from("kek-1"))
            .await
            .expect("owned key ref");
        let borrowed = CloudKeyProvider::connect(Box::new(service), "kek-1")
            .await
            .expect("borrowed key ref");
        assert_eq!(owned.key_ref(), borrowed.key_ref());
        assert!(owned.is_available().await);
    }

    #[tokio::test]
    async fn connect_rejects_disabled_key() {
        let service = InMemoryKeyService::with_policy(KeyPolicy {
            key_ref: "kek-1".into(),
            enabled: false,
            allowed_operations: vec![KeyOperation::Wrap, KeyOperation::Unwrap],
        });
        let err = CloudKeyProvider::connect(Box::new(service), "kek-1")
            .await
            .err()
            .expect("disabled key");
        assert!(matches!(err, KmsError::Configuration(_)));
    }

    #[tokio::test]
    async fn connect_rejects_policy_without_unwrap() {
        let service = InMemoryKeyService::with_policy(KeyPolicy {
            key_ref: "kek-1".into(),
            enabled: true,
            allowed_operations: vec![KeyOperation::Wrap],
        });
        let err = CloudKeyProvider::connect(Box::new(service), "kek-1")
            .await
            .err()
            .expect("policy forbids unwrap");
        assert!(matches!(err, KmsError::Configuration(_)));
    }

    #[tokio::test]
    async fn connect_fails_when_service_unreachable() {
        let service = InMemoryKeyService::new("kek-1");
        service.set_available(false);
        let err = CloudKeyProvider::connect(Box::new(service), "kek-1")
            .await
            .err()
            .expect("unreachable");
        assert!(matches!(err, KmsError::Configuration(_)));
    }

    #[tokio::test]
    async fn outage_after_connect_is_retryable() {
        let service = Arc::new(InMemoryKeyService::new("kek-1"));
        let provider = CloudKeyProvider::connect(Box::new(service.clone()), "kek-1")
            .await
            .expect("connect");
        let wrapped = provider
            .encrypt_dek(&[3u8; 32], "dek_1", b"acme")
            .await
            .expect("wrap");

        service.set_available(false);
        assert!(!provider.is_available().await);
        let err = provider
            .decrypt_dek(&wrapped, "dek_1", b"acme")
            .await
            .expect_err("offline");
        assert!(matches!(err, KmsError::Unavailable(_)));

        service.set_available(true);
        let dek = provider
            .decrypt_dek(&wrapped, "dek_1", b"acme")
            .await
            .expect("unwrap");
        assert_eq!(dek.as_slice(), &[3u8; 32]);
        assert_eq!(provider.key_ref().as_deref(), Some("kek-1"));
    }

    #[test]
    fn http_client_builds_bearer_header() {
        let client = HttpKeyServiceClient::new("https://kms.example.test/", "tok").expect("client");
        let headers = client.headers().expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer tok")
        );
        assert_eq!(
            client.key_url("kek-1"),
            "https://kms.example.test/v1/keys/kek-1"
        );
    }
}
