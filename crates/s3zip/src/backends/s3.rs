//! 🪣📡 The S3 backend: the real one, with the real bill.
//!
//! 🧠 Knowledge graph:
//! - Config: region (default us-east-1), optional endpoint override for S3-compatibles
//!   (MinIO, LocalStack, a wiremock in a test), optional static credentials. Without static
//!   credentials the default AWS chain applies: env vars → ~/.aws/config → IAM role → hope.
//! - Listing: `ListObjectsV2` through the SDK paginator, so prefixes with more than
//!   1000 keys get all of their keys.
//! - Probe: `HeadObject`. Fetch: `GetObject`, body pulled chunk by chunk with
//!   `ByteStream::try_next()`, each chunk appended to the sink before the next is read.
//! - Upload: multipart (create / upload part / complete / abort).
//! - Errors: HTTP 404 / `NoSuchKey` / `NotFound` → NotFound, 403 / `AccessDenied` →
//!   AccessDenied, everything else → Unavailable with the SDK's full error context.

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::backends::{
    EntrySink, FetchError, ObjectMeta, ObjectStore, StoreError, UploadedPart,
};

/// 🔧 Where S3 lives and who we are when we knock.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct S3StoreConfig {
    /// 🌎 us-east-1 unless told otherwise. The Florida of AWS regions.
    pub region: String,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint_url: Option<String>,
    /// `http://host/bucket/key` instead of `http://bucket.host/key`. MinIO likes this.
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

/// 🪣 An `aws_sdk_s3::Client` in an `ObjectStore` costume.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// 🚀 Build the SDK client. Nothing goes over the wire yet; credentials resolve lazily.
    pub async fn new(config: S3StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                debug!("🔑 using static credentials for S3");
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    config.session_token.clone(),
                    None,
                    "s3zip-static",
                ));
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!(
                    "🔑 only half of a static key pair was configured, falling back to the default credential chain"
                );
            }
            (None, None) => {}
        }

        let shared = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }
}

/// 🔍 Sort an SDK failure into the buckets the pipeline cares about.
fn classify<E>(err: SdkError<E, HttpResponse>, context: String, target: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_owned);

    match (status, code.as_deref()) {
        (Some(404), _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => StoreError::NotFound {
            key: target.to_string(),
        },
        (Some(403), _) | (_, Some("AccessDenied")) => StoreError::AccessDenied {
            target: target.to_string(),
        },
        _ => StoreError::unavailable(context, DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                classify(e, format!("listing s3://{bucket}/{prefix}"), bucket)
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_owned),
            );
        }
        debug!("📚 listed {} keys under s3://{bucket}/{prefix}", keys.len());
        Ok(keys)
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, format!("probing s3://{bucket}/{key}"), key))?;

        Ok(ObjectMeta {
            size: head
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
        })
    }

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn EntrySink + Send),
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, format!("fetching s3://{bucket}/{key}"), key))?;

        let mut body = response.body;
        let mut fetched = 0u64;
        // -- 🚰 one network chunk at a time; the sink applies backpressure by simply not returning yet
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StoreError::unavailable(format!("reading s3://{bucket}/{key}"), e))?
        {
            trace!("🪣 {} bytes off the wire for '{key}'", chunk.len());
            sink.append(&chunk).await?;
            fetched += chunk.len() as u64;
        }
        Ok(fetched)
    }

    async fn create_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/zip")
            .send()
            .await
            .map_err(|e| classify(e, format!("starting upload to s3://{bucket}/{key}"), key))?;

        created
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::Protocol("CreateMultipartUpload returned no upload id".into()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                classify(
                    e,
                    format!("uploading part {part_number} of s3://{bucket}/{key}"),
                    key,
                )
            })?;

        let etag = uploaded.e_tag().map(str::to_owned).ok_or_else(|| {
            StoreError::Protocol(format!("UploadPart {part_number} returned no ETag"))
        })?;
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(e, format!("completing upload to s3://{bucket}/{key}"), key))?;
        Ok(())
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, format!("aborting upload to s3://{bucket}/{key}"), key))?;
        Ok(())
    }
}
