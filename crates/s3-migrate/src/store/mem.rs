//! In-memory object store.
//!
//! Backs the engine's tests and local dry runs. Implements the same
//! semantics the engine relies on in production stores: server-side
//! Content-MD5 verification, multipart uploads that vanish once completed
//! (`NoSuchUpload` for late writers), and aggregate `"<md5>-<n>"` ETags.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use md5::{Digest, Md5};

use crate::error::{MigrateError, Result, StoreErrorKind};

use super::{CommittedPart, ListedObject, ObjectHead, ObjectStore, OpenUpload};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    version_id: String,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Bytes,
    digest: [u8; 16],
    etag: String,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    initiated: DateTime<Utc>,
    parts: BTreeMap<i32, StoredPart>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    denied: HashSet<(String, String)>,
    /// Range-start offsets whose GETs never return (timeout testing).
    stalled_offsets: HashSet<i64>,
}

/// In-memory [`ObjectStore`] with fault-injection hooks for tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    seq: AtomicI64,
    /// Fail this many upcoming GETs with a transient error.
    transient_get_failures: AtomicUsize,
    /// Fail this many upcoming open-upload listings with a transient error.
    transient_listing_failures: AtomicUsize,
    /// Fail this many upcoming upload creations with a transient error.
    transient_create_failures: AtomicUsize,
    range_gets: AtomicUsize,
    part_uploads: AtomicUsize,
    puts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Seed an object directly (test setup).
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = object_etag(&data);
        let version_id = format!("v{}", self.next_seq());
        self.inner.lock().unwrap().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag,
                version_id,
            },
        );
    }

    /// Current object bytes, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Current object ETag, if present.
    pub fn object_etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.etag.clone())
    }

    /// Make every access to `bucket/key` fail with `AccessDenied`.
    pub fn deny_access(&self, bucket: &str, key: &str) {
        self.inner
            .lock()
            .unwrap()
            .denied
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make the next `n` GETs fail with a transient error.
    pub fn fail_next_gets(&self, n: usize) {
        self.transient_get_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` open-upload listings fail with a transient error.
    pub fn fail_next_upload_listings(&self, n: usize) {
        self.transient_listing_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` upload creations fail with a transient error.
    pub fn fail_next_creates(&self, n: usize) {
        self.transient_create_failures.store(n, Ordering::SeqCst);
    }

    /// Make ranged GETs starting at `offset` hang forever.
    pub fn stall_range_at(&self, offset: i64) {
        self.inner.lock().unwrap().stalled_offsets.insert(offset);
    }

    pub fn range_get_count(&self) -> usize {
        self.range_gets.load(Ordering::SeqCst)
    }

    pub fn part_upload_count(&self) -> usize {
        self.part_uploads.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn check_denied(inner: &Inner, bucket: &str, key: &str) -> Result<()> {
        if inner.denied.contains(&(bucket.to_string(), key.to_string())) {
            return Err(MigrateError::store(
                StoreErrorKind::AccessDenied,
                format!("access denied: {}/{}", bucket, key),
            ));
        }
        Ok(())
    }

    fn take_transient_failure(&self) -> bool {
        Self::take_from(&self.transient_get_failures)
    }

    fn take_from(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fetch(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<StoredObject> {
        if self.take_transient_failure() {
            return Err(MigrateError::store_other("injected transient failure"));
        }
        let inner = self.inner.lock().unwrap();
        Self::check_denied(&inner, bucket, key)?;
        let obj = inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| {
                MigrateError::store(
                    StoreErrorKind::NoSuchKey,
                    format!("no such key: {}/{}", bucket, key),
                )
            })?;
        if let Some(v) = version_id {
            if obj.version_id != v {
                return Err(MigrateError::store(
                    StoreErrorKind::NoSuchKey,
                    format!("version {} gone: {}/{}", v, bucket, key),
                ));
            }
        }
        Ok(obj.clone())
    }
}

/// `"<hex md5>"` quoted, as stores report single-put ETags.
fn object_etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn verify_content_md5(data: &[u8], content_md5: &str) -> Result<()> {
    let expected = base64::engine::general_purpose::STANDARD.encode(Md5::digest(data));
    if expected != content_md5 {
        return Err(MigrateError::store_other(format!(
            "BadDigest: content-md5 mismatch (got {}, computed {})",
            content_md5, expected
        )));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let obj = self.fetch(bucket, key, None)?;
        Ok(ObjectHead {
            size: obj.data.len() as i64,
            version_id: Some(obj.version_id),
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
        let stalled = self
            .inner
            .lock()
            .unwrap()
            .stalled_offsets
            .contains(&start);
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.range_gets.fetch_add(1, Ordering::SeqCst);
        let obj = self.fetch(bucket, key, version_id)?;
        let len = obj.data.len() as i64;
        let start = start.clamp(0, len);
        let end = (end + 1).clamp(start, len);
        Ok(obj.data.slice(start as usize..end as usize))
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Bytes> {
        Ok(self.fetch(bucket, key, version_id)?.data)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        _storage_class: Option<&str>,
    ) -> Result<String> {
        verify_content_md5(&body, content_md5)?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        let etag = object_etag(&body);
        let version_id = format!("v{}", self.next_seq());
        let mut inner = self.inner.lock().unwrap();
        Self::check_denied(&inner, bucket, key)?;
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: body,
                etag: etag.clone(),
                version_id,
            },
        );
        Ok(etag)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _storage_class: Option<&str>,
    ) -> Result<String> {
        if Self::take_from(&self.transient_create_failures) {
            return Err(MigrateError::store_other("injected transient failure"));
        }
        let seq = self.next_seq();
        let upload_id = format!("upload-{}", seq);
        let initiated = Utc.timestamp_opt(seq, 0).single().unwrap_or_else(Utc::now);
        self.inner.lock().unwrap().uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                initiated,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
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
        verify_content_md5(&body, content_md5)?;
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let upload = inner.uploads.get_mut(upload_id).ok_or_else(|| {
            MigrateError::store(
                StoreErrorKind::NoSuchUpload,
                format!("no such upload: {} ({}/{})", upload_id, bucket, key),
            )
        })?;
        let digest: [u8; 16] = Md5::digest(&body).into();
        upload.parts.insert(
            part_number,
            StoredPart {
                data: body,
                etag: format!("\"{}\"", hex::encode(digest)),
                digest,
            },
        );
        Ok(())
    }

    async fn list_open_uploads(&self, bucket: &str, prefix: &str) -> Result<Vec<OpenUpload>> {
        if Self::take_from(&self.transient_listing_failures) {
            return Err(MigrateError::store_other("injected transient failure"));
        }
        let inner = self.inner.lock().unwrap();
        let mut uploads: Vec<OpenUpload> = inner
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket && u.key.starts_with(prefix))
            .map(|(id, u)| OpenUpload {
                key: u.key.clone(),
                upload_id: id.clone(),
                initiated: u.initiated,
            })
            .collect();
        uploads.sort_by(|a, b| a.initiated.cmp(&b.initiated));
        Ok(uploads)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CommittedPart>> {
        let inner = self.inner.lock().unwrap();
        let upload = inner.uploads.get(upload_id).ok_or_else(|| {
            MigrateError::store(
                StoreErrorKind::NoSuchUpload,
                format!("no such upload: {} ({}/{})", upload_id, bucket, key),
            )
        })?;
        Ok(upload
            .parts
            .iter()
            .map(|(n, p)| CommittedPart {
                part_number: *n,
                etag: p.etag.clone(),
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CommittedPart>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let upload = inner.uploads.get(upload_id).ok_or_else(|| {
            MigrateError::store(
                StoreErrorKind::NoSuchUpload,
                format!("no such upload: {} ({}/{})", upload_id, bucket, key),
            )
        })?;

        let mut data = Vec::new();
        let mut digests = Vec::new();
        let mut sorted = parts;
        sorted.sort_by_key(|p| p.part_number);
        for part in &sorted {
            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                MigrateError::store_other(format!("InvalidPart: {}", part.part_number))
            })?;
            if stored.etag != part.etag {
                return Err(MigrateError::store_other(format!(
                    "InvalidPart: etag mismatch on part {}",
                    part.part_number
                )));
            }
            data.extend_from_slice(&stored.data);
            digests.extend_from_slice(&stored.digest);
        }

        let etag = format!(
            "\"{}-{}\"",
            hex::encode(Md5::digest(&digests)),
            sorted.len()
        );
        let version_id = format!("v{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        inner.uploads.remove(upload_id);
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
                version_id,
            },
        );
        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.uploads.remove(upload_id).ok_or_else(|| {
            MigrateError::store(
                StoreErrorKind::NoSuchUpload,
                format!("no such upload: {} ({}/{})", upload_id, bucket, key),
            )
        })?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>> {
        let inner = self.inner.lock().unwrap();
        let mut listed: Vec<ListedObject> = inner
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ListedObject {
                key: k.clone(),
                size: o.data.len() as i64,
                version_id: None,
            })
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn list_latest_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ListedObject>> {
        let inner = self.inner.lock().unwrap();
        let mut listed: Vec<ListedObject> = inner
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ListedObject {
                key: k.clone(),
                size: o.data.len() as i64,
                version_id: Some(o.version_id.clone()),
            })
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let store = InMemoryStore::new();
        let body = Bytes::from_static(b"hello world");
        let md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(&body));
        store
            .put_object("b", "k", body.clone(), &md5, None)
            .await
            .unwrap();
        assert_eq!(store.get_object("b", "k", None).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_bad_content_md5_is_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .put_object("b", "k", Bytes::from_static(b"data"), "bogus", None)
            .await
            .unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::Other));
    }

    #[tokio::test]
    async fn test_range_is_clamped_at_eof() {
        let store = InMemoryStore::new();
        store.insert_object("b", "k", Bytes::from_static(b"0123456789"));
        let got = store.get_range("b", "k", None, 8, 100).await.unwrap();
        assert_eq!(&got[..], b"89");
    }

    #[tokio::test]
    async fn test_completed_upload_rejects_late_parts() {
        let store = InMemoryStore::new();
        let id = store.create_multipart_upload("b", "k", None).await.unwrap();
        let body = Bytes::from_static(b"part");
        let md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(&body));
        store
            .upload_part("b", "k", &id, 1, body.clone(), &md5)
            .await
            .unwrap();
        let parts = store.list_parts("b", "k", &id).await.unwrap();
        store
            .complete_multipart_upload("b", "k", &id, parts)
            .await
            .unwrap();

        let err = store
            .upload_part("b", "k", &id, 2, body, &md5)
            .await
            .unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::NoSuchUpload));
    }

    #[tokio::test]
    async fn test_aggregate_etag_format() {
        let store = InMemoryStore::new();
        let id = store.create_multipart_upload("b", "k", None).await.unwrap();
        for (n, data) in [(1, b"aaaa".as_slice()), (2, b"bb".as_slice())] {
            let body = Bytes::copy_from_slice(data);
            let md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(&body));
            store.upload_part("b", "k", &id, n, body, &md5).await.unwrap();
        }
        let parts = store.list_parts("b", "k", &id).await.unwrap();
        let etag = store
            .complete_multipart_upload("b", "k", &id, parts)
            .await
            .unwrap();
        assert!(etag.ends_with("-2\""), "etag was {}", etag);
        assert_eq!(store.object("b", "k").unwrap(), Bytes::from_static(b"aaaabb"));
    }
}
