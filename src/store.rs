//! Remote object store client abstraction and its S3 implementation.
//!
//! Mirrors the shape of `remote_storage::S3Bucket` (a reference pack
//! implementation): one trait so the router can be tested against a fake,
//! one concrete type wrapping `aws_sdk_s3::Client` for production.

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::{Client, config::Region};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse as RawHttpResponse;
use bytes::Bytes;

use crate::error::StoreError;

/// Codes the AWS SDK surfaces when the credentials backing a request have
/// expired or were rejected outright. Any of these is fatal: restarting
/// the process (to pick up fresh credentials) is the only remediation.
const CREDENTIAL_EXPIRY_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "RequestExpired",
    "InvalidAccessKeyId",
    "InvalidToken",
    "InvalidClientTokenId",
    "AuthFailure",
];

/// Abstraction over the four remote-store operations the router needs.
/// Lets tests run the full request state machine against an in-memory
/// double instead of real S3.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;
    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

/// Production [`ObjectStoreClient`] backed by `aws-sdk-s3`.
pub struct S3Client {
    client: Client,
}

impl S3Client {
    /// Builds a client from the default AWS credential provider chain,
    /// optionally pointed at a custom S3-compatible endpoint (in which case
    /// path-style addressing is forced, matching how most non-AWS
    /// S3-compatible stores expect requests).
    pub async fn new(region: &str, endpoint: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if endpoint.is_some() {
            builder = builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let result = self.client.get_object().bucket(bucket).key(key).send().await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if let Some(GetObjectError::NoSuchKey(_)) = err.as_service_error() {
                    return Err(StoreError::NotFound);
                }
                return Err(classify(err));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Other {
                status: None,
                retryable: true,
                message: format!("failed to read response body: {e}"),
            })?;

        Ok(body.into_bytes())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let result = self.client.head_object().bucket(bucket).key(key).send().await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(HeadObjectError::NotFound(_)) = err.as_service_error() {
                    return Err(StoreError::NotFound);
                }
                Err(classify(err))
            }
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .body(ByteStream::from(body))
            .send()
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Classifies any `aws-sdk-s3` operation error into a [`StoreError`],
/// recognizing credential-expiry codes and otherwise falling back to
/// `Other` with the SDK's retryable hint and the raw HTTP status, when the
/// failure reached the point of getting a response at all (`raw()` is
/// `None` for `ConstructionFailure`/`TimeoutError`/`DispatchFailure`, which
/// never saw the wire).
fn classify<E>(err: aws_sdk_s3::error::SdkError<E, RawHttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let message = err.to_string();
    let status = err.raw().map(|r| u16::from(r.status()));

    if let Some(code) = code.as_deref() {
        if CREDENTIAL_EXPIRY_CODES.contains(&code) {
            return StoreError::CredentialExpiry(message);
        }
    }

    let retryable = matches!(
        err,
        aws_sdk_s3::error::SdkError::TimeoutError(_) | aws_sdk_s3::error::SdkError::DispatchFailure(_)
    );

    StoreError::Other {
        status,
        retryable,
        message,
    }
}

/// In-memory [`ObjectStoreClient`] double for tests: no network, no disk.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// A store double that serves from an in-memory map and can be told to
    /// fail the next N calls with a given [`StoreError`] kind, to exercise
    /// the breaker and offline-downgrade paths deterministically.
    #[derive(Default)]
    pub struct FakeStore {
        objects: Mutex<HashMap<String, Bytes>>,
        fail_next: AtomicU32,
        fail_with: Mutex<Option<FakeFailure>>,
        put_delay: Mutex<Option<std::time::Duration>>,
        pub calls: AtomicU32,
    }

    #[derive(Clone)]
    pub enum FakeFailure {
        CredentialExpiry,
        Retryable,
        Other(u16),
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, key: &str, body: impl Into<Bytes>) {
            self.objects.lock().insert(key.to_string(), body.into());
        }

        /// Makes the next `n` remote calls fail with `failure`.
        pub fn fail_next_calls(&self, n: u32, failure: FakeFailure) {
            self.fail_next.store(n, Ordering::SeqCst);
            *self.fail_with.lock() = Some(failure);
        }

        /// Makes every subsequent `put_object` sleep for `delay` before
        /// completing, so a caller can race it against a timeout.
        pub fn set_put_delay(&self, delay: std::time::Duration) {
            *self.put_delay.lock() = Some(delay);
        }

        fn maybe_fail(&self) -> Option<StoreError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining == 0 {
                return None;
            }
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            match self.fail_with.lock().clone() {
                Some(FakeFailure::CredentialExpiry) => {
                    Some(StoreError::CredentialExpiry("test credential expiry".into()))
                }
                Some(FakeFailure::Retryable) => Some(StoreError::Other {
                    status: Some(503),
                    retryable: true,
                    message: "test retryable error".into(),
                }),
                Some(FakeFailure::Other(status)) => Some(StoreError::Other {
                    status: Some(status),
                    retryable: false,
                    message: "test remote error".into(),
                }),
                None => None,
            }
        }
    }

    #[async_trait]
    impl ObjectStoreClient for FakeStore {
        async fn get_object(&self, _bucket: &str, key: &str) -> Result<Bytes, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.maybe_fail() {
                return Err(err);
            }
            self.objects.lock().get(key).cloned().ok_or(StoreError::NotFound)
        }

        async fn head_object(&self, _bucket: &str, key: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.maybe_fail() {
                return Err(err);
            }
            if self.objects.lock().contains_key(key) {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        }

        async fn put_object(&self, _bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = *self.put_delay.lock() {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.maybe_fail() {
                return Err(err);
            }
            self.objects.lock().insert(key.to_string(), body);
            Ok(())
        }

        async fn delete_object(&self, _bucket: &str, key: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.maybe_fail() {
                return Err(err);
            }
            self.objects.lock().remove(key);
            Ok(())
        }
    }
}
