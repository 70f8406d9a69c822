//! Object-store abstraction.
//!
//! The engine talks to the two buckets through the [`ObjectStore`] trait so
//! the transfer machinery can be exercised against the in-memory
//! implementation in tests while production uses the S3-backed one.

mod mem;
mod s3;

pub use mem::InMemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Metadata returned by a head request.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: i64,
    pub version_id: Option<String>,
}

/// One object in a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: i64,
    /// `None` when the listing is not version-aware.
    pub version_id: Option<String>,
}

/// An incomplete multipart upload on the destination store.
#[derive(Debug, Clone)]
pub struct OpenUpload {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// A part already durably stored under an upload id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Minimal object-store surface the engine needs.
///
/// Ranged reads use inclusive byte ranges (`start..=end`), matching the HTTP
/// Range header the stores speak. All listing operations paginate internally
/// and return the full result.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object size and current version id.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead>;

    /// Read one byte range. `version_id` pins a specific object version.
    /// A range end past EOF is clamped by the store.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        start: i64,
        end: i64,
    ) -> Result<Bytes>;

    /// Read a whole object (small-object path).
    async fn get_object(&self, bucket: &str, key: &str, version_id: Option<&str>)
        -> Result<Bytes>;

    /// Write a whole object. `content_md5` is the base64 digest the store
    /// verifies server-side. Returns the resulting ETag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        storage_class: Option<&str>,
    ) -> Result<String>;

    /// Start a multipart upload, returning its upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String>;

    /// Upload one part under an open upload id, with server-side MD5 check.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        content_md5: &str,
    ) -> Result<()>;

    /// List incomplete multipart uploads under a key prefix.
    async fn list_open_uploads(&self, bucket: &str, prefix: &str) -> Result<Vec<OpenUpload>>;

    /// List parts already committed under an upload id, ascending.
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CommittedPart>>;

    /// Commit the listed parts as one object. Returns the final ETag.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CommittedPart>,
    ) -> Result<String>;

    /// Abort an open upload, discarding its parts.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<()>;

    /// Delete an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// List objects under a prefix (latest versions only, no version ids).
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>>;

    /// List latest object versions under a prefix, with version ids.
    async fn list_latest_versions(&self, bucket: &str, prefix: &str)
        -> Result<Vec<ListedObject>>;
}
