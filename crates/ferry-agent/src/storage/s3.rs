//! S3 multipart uploader

use std::future::Future;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    config::Credentials,
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart},
    Client,
};
use ferry_common::checksum::sha256_base64;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    Body, MultipartHandle, MultipartUploader, PutOutcome, PutRequest, StorageConfig, StorageError,
    StorageResult,
};

const NO_SUCH_UPLOAD: &str = "NoSuchUpload";

fn transfer_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Transfer(Box::new(err))
}

/// Race `fut` against the token, reporting `multipart` on cancellation
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    multipart: Option<&MultipartHandle>,
    fut: impl Future<Output = StorageResult<T>>,
) -> StorageResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled {
            multipart: multipart.cloned(),
        }),
        result = fut => result,
    }
}

/// Read up to `part_size` bytes; a short result means end of body
async fn read_part(body: &mut Body, part_size: usize) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(part_size);
    (&mut *body)
        .take(part_size as u64)
        .read_to_end(&mut buf)
        .await?;
    Ok(buf)
}

#[derive(Clone)]
pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!("Initializing S3 uploader with config: {:?}", config);

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if config.has_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "ferry-storage",
            ));
        }
        let sdk_config = loader.load().await;

        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        info!("S3 uploader initialized for bucket: {}", config.bucket);

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    async fn put_empty(
        &self,
        request: &PutRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<PutOutcome> {
        let send = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .metadata("organization-id", &request.metadata.organization_id)
            .metadata("dataset-id", &request.metadata.dataset_id)
            .metadata("manifest-id", &request.metadata.manifest_id)
            .checksum_sha256(sha256_base64(&[]))
            .body(ByteStream::from(Vec::new()))
            .send();

        until_cancelled(cancel, None, async { send.await.map_err(transfer_error) }).await?;

        Ok(PutOutcome {
            key: request.key.clone(),
            parts: 0,
            bytes: 0,
        })
    }

    async fn upload_parts(
        &self,
        request: &PutRequest,
        handle: &MultipartHandle,
        mut body: Body,
        cancel: &CancellationToken,
    ) -> StorageResult<PutOutcome> {
        let part_size = request.effective_part_size() as usize;
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut bytes = 0u64;

        loop {
            let data = until_cancelled(cancel, Some(handle), read_part(&mut body, part_size)).await?;
            if data.is_empty() {
                break;
            }

            let len = data.len();
            let checksum = sha256_base64(&data);
            let send = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&handle.key)
                .upload_id(&handle.multipart_id)
                .part_number(part_number)
                .checksum_sha256(&checksum)
                .body(ByteStream::from(data))
                .send();
            let output =
                until_cancelled(cancel, Some(handle), async { send.await.map_err(transfer_error) })
                    .await?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .checksum_sha256(checksum)
                    .build(),
            );
            bytes += len as u64;
            debug!(key = %handle.key, part_number, bytes, "Uploaded part");

            part_number += 1;
            if len < part_size {
                break;
            }
        }

        let part_count = parts.len();
        let send = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&handle.key)
            .upload_id(&handle.multipart_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send();
        until_cancelled(cancel, Some(handle), async { send.await.map_err(transfer_error) }).await?;

        Ok(PutOutcome {
            key: handle.key.clone(),
            parts: part_count,
            bytes,
        })
    }
}

#[async_trait]
impl MultipartUploader for S3Uploader {
    #[instrument(skip(self, body, cancel), fields(key = %request.key, size = request.size))]
    async fn put(
        &self,
        request: PutRequest,
        body: Body,
        cancel: &CancellationToken,
    ) -> StorageResult<PutOutcome> {
        if request.size == 0 {
            return self.put_empty(&request, cancel).await;
        }

        let send = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .metadata("organization-id", &request.metadata.organization_id)
            .metadata("dataset-id", &request.metadata.dataset_id)
            .metadata("manifest-id", &request.metadata.manifest_id)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send();
        let created =
            until_cancelled(cancel, None, async { send.await.map_err(transfer_error) }).await?;

        let multipart_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return an upload id".to_string()))?
            .to_string();
        let handle = MultipartHandle {
            key: request.key.clone(),
            multipart_id,
        };

        match self.upload_parts(&request, &handle, body, cancel).await {
            Ok(outcome) => {
                info!(key = %outcome.key, parts = outcome.parts, bytes = outcome.bytes, "Upload complete");
                Ok(outcome)
            }
            Err(err @ StorageError::Cancelled { .. }) => Err(err),
            Err(err) => {
                if let Err(abort_err) = self.abort(&handle).await {
                    warn!(
                        key = %handle.key,
                        multipart_id = %handle.multipart_id,
                        error = %abort_err,
                        "Failed to abort multipart upload after error, orphaned parts may remain"
                    );
                }
                Err(err)
            }
        }
    }

    async fn abort(&self, handle: &MultipartHandle) -> StorageResult<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&handle.key)
            .upload_id(&handle.multipart_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err.as_service_error().and_then(|e| e.code()) == Some(NO_SUCH_UPLOAD) =>
            {
                Ok(())
            }
            Err(err) => Err(transfer_error(err)),
        }
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> StorageResult<usize> {
        let result = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(&handle.key)
            .upload_id(&handle.multipart_id)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output.parts().len()),
            Err(err)
                if err.as_service_error().and_then(|e| e.code()) == Some(NO_SUCH_UPLOAD) =>
            {
                Err(StorageError::NoSuchUpload(handle.multipart_id.clone()))
            }
            Err(err) => Err(transfer_error(err)),
        }
    }
}
