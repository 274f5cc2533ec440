//! S3 object-storage backend.
//!
//! Listing uses delimiter `/` so common prefixes present as directories.
//! Downloads honour a byte-range resume offset; uploads always go through
//! multipart (5 MiB parts, four in flight) and ignore resume offsets by
//! restarting from zero, which the queue detects on the next progress tick.

use std::path::Path;
use std::sync::atomic::Ordering;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{CancelFlag, ProgressFn};
use crate::error::{RemoteError, RemoteResult};
use crate::paths::{key_prefix, remote_path_to_key};
use crate::types::{DirectoryEntry, Profile, RemoteStat, MODE_DIRECTORY};

const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;
const MULTIPART_QUEUE_DEPTH: usize = 4;

pub struct S3Backend {
    client: S3Client,
    bucket: String,
}

impl S3Backend {
    pub async fn connect(profile: &Profile) -> RemoteResult<Self> {
        let bucket = profile.bucket.clone().unwrap_or_default();
        let client = to_s3_client(profile)?;

        // Cheap access probe so connect surfaces credential and bucket
        // problems instead of the first listing.
        client
            .head_bucket()
            .bucket(bucket.clone())
            .send()
            .await
            .map_err(|err| {
                let code = err.code().map(str::to_string);
                let status = err.raw_response().map(|r| r.status().as_u16());
                match (code.as_deref(), status) {
                    (Some("AccessDenied") | Some("Forbidden"), _) | (_, Some(403)) => {
                        RemoteError::BucketAccessDenied(bucket.clone())
                    }
                    (Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch"), _) => {
                        RemoteError::AuthFailed(describe_sdk_error(&err))
                    }
                    (Some("NoSuchBucket") | Some("NotFound"), _) | (_, Some(404)) => {
                        RemoteError::NotFound(bucket.clone())
                    }
                    _ => map_transport_or_protocol(err),
                }
            })?;

        Ok(Self { client, bucket })
    }

    pub async fn list(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        let prefix = key_prefix(path);
        let mut continuation_token: Option<String> = None;
        let mut entries: Vec<DirectoryEntry> = Vec::new();

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket.clone())
                .delimiter("/")
                .max_keys(1000);
            if !prefix.is_empty() {
                request = request.prefix(prefix.clone());
            }
            if let Some(token) = continuation_token.as_deref() {
                request = request.continuation_token(token.to_string());
            }

            let output = request
                .send()
                .await
                .map_err(|err| map_s3_error(err, path))?;

            for common in output.common_prefixes() {
                let Some(full) = common.prefix() else { continue };
                let name = full
                    .trim_start_matches(&prefix)
                    .trim_end_matches('/')
                    .to_string();
                if name.is_empty() {
                    continue;
                }
                entries.push(DirectoryEntry {
                    name,
                    is_directory: true,
                    size: 0,
                    modified: 0,
                });
            }

            for item in output.contents() {
                let Some(key) = item.key() else { continue };
                // The zero-byte placeholder for the prefix itself.
                if key == prefix {
                    continue;
                }
                let name = key.trim_start_matches(&prefix).to_string();
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                entries.push(DirectoryEntry {
                    name,
                    is_directory: false,
                    size: item.size().unwrap_or(0).max(0) as u64,
                    modified: item.last_modified().map(|t| t.secs()).unwrap_or(0),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        debug!(path = %path, count = entries.len(), "listed prefix");
        Ok(entries)
    }

    /// `stat` for a store with no directories: a real object is a file; a
    /// missing object whose prefix has children is a directory.
    pub async fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        let key = remote_path_to_key(path);
        if key.is_empty() {
            return Ok(RemoteStat {
                size: 0,
                mtime: 0,
                mode: MODE_DIRECTORY,
            });
        }

        match self
            .client
            .head_object()
            .bucket(self.bucket.clone())
            .key(key.clone())
            .send()
            .await
        {
            Ok(head) => Ok(RemoteStat {
                size: head.content_length().unwrap_or(0).max(0) as u64,
                mtime: head.last_modified().map(|t| t.secs()).unwrap_or(0),
                mode: 0o100644,
            }),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false)
                    || is_not_found(&err);
                if !missing {
                    return Err(map_s3_error(err, path));
                }
                let probe = self
                    .client
                    .list_objects_v2()
                    .bucket(self.bucket.clone())
                    .prefix(format!("{key}/"))
                    .delimiter("/")
                    .max_keys(1)
                    .send()
                    .await
                    .map_err(|err| map_s3_error(err, path))?;
                let has_children =
                    !probe.contents().is_empty() || !probe.common_prefixes().is_empty();
                if has_children {
                    Ok(RemoteStat {
                        size: 0,
                        mtime: 0,
                        mode: MODE_DIRECTORY,
                    })
                } else {
                    Err(RemoteError::NotFound(path.to_string()))
                }
            }
        }
    }

    /// Ranged download; `offset > 0` requests `bytes=offset-` and appends
    /// to the local file.
    pub async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let key = remote_path_to_key(remote);

        let mut request = self
            .client
            .get_object()
            .bucket(self.bucket.clone())
            .key(key);
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let output = request
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        let total = offset + output.content_length().unwrap_or(0).max(0) as u64;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(local)
                .await?
        } else {
            tokio::fs::File::create(local).await?
        };
        let mut writer = BufWriter::new(file);
        let mut body = output.body;
        let mut transferred = offset;

        while let Some(bytes) = body
            .try_next()
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?
        {
            if cancel.load(Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            writer.write_all(&bytes).await?;
            transferred += bytes.len() as u64;
            on_progress(transferred, bytes.len() as u64, total);
        }
        writer.flush().await?;
        Ok(transferred)
    }

    /// Multipart upload. A resume offset cannot be honoured (parts are not
    /// appendable), so a nonzero offset restarts from zero and progress is
    /// reported from zero.
    pub async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        if offset > 0 {
            warn!(remote, offset, "upload resume not supported, restarting from zero");
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(RemoteError::Cancelled);
        }

        let key = remote_path_to_key(remote);
        let total = tokio::fs::metadata(local).await?.len();

        if total == 0 {
            self.client
                .put_object()
                .bucket(self.bucket.clone())
                .key(key)
                .body(ByteStream::from(Vec::<u8>::new()))
                .send()
                .await
                .map_err(|err| map_s3_error(err, remote))?;
            on_progress(0, 0, 0);
            return Ok(0);
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket.clone())
            .key(key.clone())
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        let upload_id = multipart
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Protocol("missing multipart upload id".to_string()))?;

        let result = self
            .upload_parts(local, &key, &upload_id, total, cancel, &mut on_progress)
            .await;

        match result {
            Ok(transferred) => {
                on_progress(total, 0, total);
                Ok(transferred)
            }
            Err(err) => {
                // Never leak server-side multipart state.
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(self.bucket.clone())
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        local: &Path,
        key: &str,
        upload_id: &str,
        total: u64,
        cancel: &CancelFlag,
        on_progress: &mut ProgressFn,
    ) -> RemoteResult<u64> {
        let mut file = tokio::fs::File::open(local).await?;
        let mut part_number: i32 = 1;
        let mut transferred: u64 = 0;
        let mut completed: Vec<(i32, Option<String>)> = Vec::new();
        let mut in_flight: JoinSet<RemoteResult<(i32, Option<String>, u64)>> = JoinSet::new();

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }

            let mut buffer = vec![0u8; MULTIPART_PART_SIZE];
            let mut read_total = 0usize;
            while read_total < buffer.len() {
                let read = file.read(&mut buffer[read_total..]).await?;
                if read == 0 {
                    break;
                }
                read_total += read;
            }
            if read_total == 0 {
                break;
            }
            buffer.truncate(read_total);

            while in_flight.len() >= MULTIPART_QUEUE_DEPTH {
                let (number, etag, len) = join_part(&mut in_flight).await?;
                completed.push((number, etag));
                transferred += len;
                on_progress(transferred.min(total), len, total);
            }

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let number = part_number;
            in_flight.spawn(async move {
                let len = buffer.len() as u64;
                let output = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key.clone())
                    .upload_id(upload_id)
                    .part_number(number)
                    .body(ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(|err| map_s3_error(err, &key))?;
                Ok((number, output.e_tag().map(str::to_string), len))
            });
            part_number += 1;
        }

        while !in_flight.is_empty() {
            if cancel.load(Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            let (number, etag, len) = join_part(&mut in_flight).await?;
            completed.push((number, etag));
            transferred += len;
            on_progress(transferred.min(total), len, total);
        }

        completed.sort_by_key(|(number, _)| *number);
        let parts: Vec<CompletedPart> = completed
            .into_iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .set_e_tag(etag)
                    .part_number(number)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket.clone())
            .key(key.to_string())
            .upload_id(upload_id.to_string())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| map_s3_error(err, key))?;

        Ok(transferred)
    }

    pub async fn read_file(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(self.bucket.clone())
            .key(remote_path_to_key(remote))
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    pub async fn write_file(&self, remote: &str, contents: &[u8]) -> RemoteResult<()> {
        self.client
            .put_object()
            .bucket(self.bucket.clone())
            .key(remote_path_to_key(remote))
            .body(ByteStream::from(contents.to_vec()))
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        Ok(())
    }

    /// Directories are synthesised; creating one writes the conventional
    /// zero-byte placeholder key.
    pub async fn mkdir(&self, remote: &str) -> RemoteResult<()> {
        let key = format!("{}/", remote_path_to_key(remote));
        self.client
            .put_object()
            .bucket(self.bucket.clone())
            .key(key)
            .body(ByteStream::from(Vec::<u8>::new()))
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        Ok(())
    }

    pub async fn remove_file(&self, remote: &str) -> RemoteResult<()> {
        self.client
            .delete_object()
            .bucket(self.bucket.clone())
            .key(remote_path_to_key(remote))
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        Ok(())
    }

    pub async fn remove_dir(&self, remote: &str) -> RemoteResult<()> {
        // Only the placeholder can remain once the children are gone;
        // deleting a missing key is a success in this store.
        self.client
            .delete_object()
            .bucket(self.bucket.clone())
            .key(format!("{}/", remote_path_to_key(remote)))
            .send()
            .await
            .map_err(|err| map_s3_error(err, remote))?;
        Ok(())
    }
}

async fn join_part(
    in_flight: &mut JoinSet<RemoteResult<(i32, Option<String>, u64)>>,
) -> RemoteResult<(i32, Option<String>, u64)> {
    match in_flight.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(join_err)) => Err(RemoteError::Internal(join_err.to_string())),
        None => Err(RemoteError::Internal(
            "multipart worker set drained unexpectedly".to_string(),
        )),
    }
}

fn to_s3_client(profile: &Profile) -> RemoteResult<S3Client> {
    let access_key_id = profile.access_key_id.clone().unwrap_or_default();
    let secret_access_key = profile.secret_access_key.clone().unwrap_or_default();
    if access_key_id.trim().is_empty() || secret_access_key.trim().is_empty() {
        return Err(RemoteError::AuthFailed(
            "profile credentials are missing".to_string(),
        ));
    }

    let region = profile
        .region
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("us-east-1");

    let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "skiff");

    let mut config_builder = aws_sdk_s3::config::Builder::new()
        .behavior_version_latest()
        .region(Region::new(region.to_string()))
        .credentials_provider(credentials);

    // Path-style addressing only when a custom endpoint is configured.
    if let Some(endpoint) = profile
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        url::Url::parse(endpoint)
            .map_err(|err| RemoteError::Internal(format!("invalid endpoint: {err}")))?;
        config_builder = config_builder
            .endpoint_url(endpoint.to_string())
            .force_path_style(true);
    }

    Ok(S3Client::from_conf(config_builder.build()))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(err.code(), Some("NoSuchKey") | Some("NotFound") | Some("404"))
        || err
            .raw_response()
            .map(|response| response.status().as_u16() == 404)
            .unwrap_or(false)
}

fn map_s3_error<E>(err: SdkError<E>, path: &str) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if is_not_found(&err) {
        return RemoteError::NotFound(path.to_string());
    }
    let code = err.code().map(str::to_string);
    match code.as_deref() {
        Some("AccessDenied") | Some("Forbidden") => RemoteError::Permission(path.to_string()),
        Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") | Some("ExpiredToken") => {
            RemoteError::AuthFailed(describe_sdk_error(&err))
        }
        _ => map_transport_or_protocol(err),
    }
}

fn map_transport_or_protocol<E>(err: SdkError<E>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            RemoteError::NetworkUnreachable(describe_sdk_error(&err))
        }
        SdkError::ResponseError(_) => RemoteError::NetworkDropped(describe_sdk_error(&err)),
        _ => RemoteError::Protocol(describe_sdk_error(&err)),
    }
}

fn describe_sdk_error<E>(err: &SdkError<E>) -> String
where
    E: ProvideErrorMetadata,
{
    match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => "request failed".to_string(),
    }
}
