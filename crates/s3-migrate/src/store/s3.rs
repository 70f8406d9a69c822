//! S3-backed [`ObjectStore`].

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{MigrateError, Result, StoreErrorKind};

use super::{CommittedPart, ListedObject, ObjectHead, ObjectStore, OpenUpload};

/// Object store backed by an S3 (or S3-compatible) endpoint.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map an SDK error onto the engine's store-failure taxonomy.
fn classify<E, R>(err: SdkError<E, R>) -> MigrateError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let kind = match err.code() {
        Some("NoSuchKey") | Some("NoSuchVersion") | Some("NotFound") => StoreErrorKind::NoSuchKey,
        Some("AccessDenied") => StoreErrorKind::AccessDenied,
        Some("NoSuchUpload") => StoreErrorKind::NoSuchUpload,
        _ => StoreErrorKind::Other,
    };
    let message = match (err.code(), err.message()) {
        (Some(code), Some(msg)) => format!("{}: {}", code, msg),
        _ => format!("{:?}", err),
    };
    MigrateError::store(kind, message)
}

fn to_chrono(dt: &aws_smithy_types::DateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos())
        .single()
        .unwrap_or_else(Utc::now)
}

async fn collect_body(body: ByteStream) -> Result<Bytes> {
    let aggregated = body
        .collect()
        .await
        .map_err(|e| MigrateError::store_other(format!("body read failed: {}", e)))?;
    Ok(aggregated.into_bytes())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(ObjectHead {
            size: head.content_length().unwrap_or(0),
            version_id: head.version_id().map(str::to_string),
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        start: i64,
        end: i64,
    ) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={}-{}", start, end))
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(classify)?;
        collect_body(resp.body).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(classify)?;
        collect_body(resp.body).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        storage_class: Option<&str>,
    ) -> Result<String> {
        let resp = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_md5(content_md5)
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(classify)?;
        Ok(resp.e_tag().unwrap_or_default().to_string())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(classify)?;
        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| MigrateError::store_other("create_multipart_upload returned no id"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        content_md5: &str,
    ) -> Result<()> {
        self.client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .content_md5(content_md5)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    // No generated paginator for this marker-paginated operation, so the
    // key/upload-id markers are threaded by hand.
    async fn list_open_uploads(&self, bucket: &str, prefix: &str) -> Result<Vec<OpenUpload>> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_multipart_uploads()
                .bucket(bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(classify)?;
            for u in page.uploads() {
                let (Some(key), Some(upload_id)) = (u.key(), u.upload_id()) else {
                    continue;
                };
                uploads.push(OpenUpload {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    initiated: u.initiated().map(to_chrono).unwrap_or_else(Utc::now),
                });
            }
            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_string);
            upload_id_marker = page.next_upload_id_marker().map(str::to_string);
        }
        Ok(uploads)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CommittedPart>> {
        let mut parts = Vec::new();
        let mut pages = self
            .client
            .list_parts()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(classify)?;
            for p in page.parts() {
                let (Some(number), Some(etag)) = (p.part_number(), p.e_tag()) else {
                    continue;
                };
                parts.push(CommittedPart {
                    part_number: number,
                    etag: etag.to_string(),
                });
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CommittedPart>,
    ) -> Result<String> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();
        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(classify)?;
        Ok(resp.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>> {
        let mut listed = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(classify)?;
            for o in page.contents() {
                let Some(key) = o.key() else { continue };
                listed.push(ListedObject {
                    key: key.to_string(),
                    size: o.size().unwrap_or(0),
                    version_id: None,
                });
            }
        }
        Ok(listed)
    }

    async fn list_latest_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ListedObject>> {
        let mut listed = Vec::new();
        // Marker-paginated as well, over key + version-id markers.
        let mut key_marker: Option<String> = None;
        let mut version_id_marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_object_versions()
                .bucket(bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_id_marker.take())
                .send()
                .await
                .map_err(classify)?;
            for v in page.versions() {
                if !v.is_latest().unwrap_or(false) {
                    continue;
                }
                let Some(key) = v.key() else { continue };
                listed.push(ListedObject {
                    key: key.to_string(),
                    size: v.size().unwrap_or(0),
                    version_id: v.version_id().map(str::to_string),
                });
            }
            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_string);
            version_id_marker = page.next_version_id_marker().map(str::to_string);
        }
        Ok(listed)
    }
}
