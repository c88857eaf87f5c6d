use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use rand::Rng;
use tracing::{info, warn};

use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;

/// Uploads one finished buffer to the object store.
///
/// Abstracted so the buffering and flushing machinery can be exercised
/// against an in-memory recorder in tests.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> RowcastResult<()>;
}

/// Retry parameters for uploads.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Total attempts before the upload fails.
    pub max_attempts: u32,
    /// Backoff before attempt n is `backoff_base << n` plus jitter drawn
    /// uniformly from `[0, backoff/4]`.
    pub backoff_base: Duration,
    /// Per-attempt request deadline.
    pub request_timeout: Duration,
}

impl Default for UploadPolicy {
    fn default() -> UploadPolicy {
        UploadPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadPolicy {
    /// Runs an upload attempt under this policy until it succeeds or the
    /// attempt budget is spent.
    pub async fn run<F, Fut>(&self, key: &str, mut attempt_fn: F) -> RowcastResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RowcastResult<()>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = self.backoff_base * (1 << attempt);
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..=backoff / 4);
                tokio::time::sleep(backoff + jitter).await;
                warn!(key, attempt = attempt + 1, "retrying object upload");
            }

            match tokio::time::timeout(self.request_timeout, attempt_fn()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(upload_error)) => {
                    warn!(key, attempt = attempt + 1, error = %upload_error, "object upload failed");
                    last_error = Some(upload_error);
                }
                Err(_elapsed) => {
                    warn!(key, attempt = attempt + 1, "object upload timed out");
                    last_error = Some(rowcast_error!(
                        ErrorKind::DestinationError,
                        "object upload timed out"
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            rowcast_error!(ErrorKind::DestinationError, "object upload failed")
        }))
    }
}

/// S3 client with upload retries, usable against any S3-compatible endpoint.
pub struct AwsS3Client {
    client: Client,
    bucket: String,
    policy: UploadPolicy,
}

impl AwsS3Client {
    /// Builds the client and verifies bucket access with a head request.
    pub async fn connect(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
    ) -> RowcastResult<AwsS3Client> {
        if bucket.is_empty() {
            return Err(rowcast_error!(
                ErrorKind::ConfigError,
                "s3 bucket is required"
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (access_key_id, secret_access_key)
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "rowcast-s3",
            ));
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "s3 bucket access check failed",
                    err
                )
            })?;

        info!(bucket, "connected to s3 bucket");

        Ok(AwsS3Client {
            client,
            bucket: bucket.to_string(),
            policy: UploadPolicy::default(),
        })
    }
}

#[async_trait]
impl ObjectStoreClient for AwsS3Client {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> RowcastResult<()> {
        info!(
            bucket = self.bucket,
            key,
            content_size = body.len(),
            "uploading events to s3"
        );

        self.policy
            .run(key, || {
                let request = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type("application/x-ndjson")
                    .body(ByteStream::from(body.clone()));
                async move {
                    request.send().await.map(|_| ()).map_err(|err| {
                        rowcast_error!(
                            ErrorKind::DestinationError,
                            "s3 put_object failed",
                            err
                        )
                    })
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> UploadPolicy {
        UploadPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = fast_policy()
            .run("k", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(rowcast_error!(ErrorKind::DestinationError, "still down"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_once_the_store_recovers() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        fast_policy()
            .run("k", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(rowcast_error!(ErrorKind::DestinationError, "still down"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeouts_count_as_failed_attempts() {
        let policy = UploadPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            request_timeout: Duration::from_millis(5),
        };

        let result = policy
            .run("k", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().to_string().contains("timed out"));
    }
}
