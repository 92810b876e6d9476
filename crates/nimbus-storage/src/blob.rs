//! Encrypted blob store
//!
//! A blob's encryption status is decided once, at creation: with a user
//! master key the content is sealed under a fresh DEK and stored as
//! `[12-byte nonce][16-byte tag][ciphertext]`; without one it is stored raw.
//! Readers must consult the file record's wrapped DEK, never the bytes.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use nimbus_core::config::{StorageConfig, UploadConfig};
use nimbus_core::{
    validate_storage_key, BatchOutcome, EncryptedBlob, FileMetadata, NimbusError, NimbusResult,
    StorageStatus,
};
use nimbus_crypto::{aead, generate_dek, unwrap_dek, wrap_dek, UserMasterKey, NONCE_SIZE, TAG_SIZE};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::preview::{is_image_mime, render_placeholder, PREVIEW_SUFFIX};
use crate::records::RecordStore;

/// A lazily-read stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Chunk size for streamed reads
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub struct BlobStore {
    root: PathBuf,
    staging: PathBuf,
    previews: bool,
    preview_max_dim: u32,
    delete_concurrency: usize,
}

impl BlobStore {
    /// Open (and create if needed) a store rooted at `root`, staging under `root/staging`.
    pub async fn open(root: &Path) -> NimbusResult<Self> {
        Self::open_with(root, &root.join("staging")).await
    }

    pub async fn open_with(root: &Path, staging: &Path) -> NimbusResult<Self> {
        fs::create_dir_all(root.join("blobs")).await?;
        fs::create_dir_all(staging).await?;
        Ok(Self {
            root: root.to_path_buf(),
            staging: staging.to_path_buf(),
            previews: true,
            preview_max_dim: 32,
            delete_concurrency: 8,
        })
    }

    pub async fn from_config(storage: &StorageConfig, upload: &UploadConfig) -> NimbusResult<Self> {
        let store = Self::open_with(&storage.root, &storage.staging_dir()).await?;
        Ok(store
            .with_previews(upload.previews, upload.preview_max_dim)
            .with_delete_concurrency(storage.delete_concurrency))
    }

    pub fn with_previews(mut self, enabled: bool, max_dim: u32) -> Self {
        self.previews = enabled;
        self.preview_max_dim = max_dim;
        self
    }

    pub fn with_delete_concurrency(mut self, n: usize) -> Self {
        self.delete_concurrency = n.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for in-flight upload parts.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Path of a staged upload part for `storage_key`.
    pub fn staged_path(&self, storage_key: &str) -> NimbusResult<PathBuf> {
        validate_storage_key(storage_key)?;
        Ok(self.staging.join(format!("{storage_key}.part")))
    }

    fn blob_path(&self, storage_key: &str) -> NimbusResult<PathBuf> {
        validate_storage_key(storage_key)?;
        // Two-level sharding: first two chars as subdirectory
        let shard = if storage_key.len() >= 2 {
            &storage_key[..2]
        } else {
            "__"
        };
        Ok(self.root.join("blobs").join(shard).join(storage_key))
    }

    fn preview_path(&self, storage_key: &str) -> NimbusResult<PathBuf> {
        let blob = self.blob_path(storage_key)?;
        Ok(blob.with_file_name(format!("{storage_key}.{PREVIEW_SUFFIX}")))
    }

    /// Persist file content under `storage_key`, encrypting it when a
    /// user master key is supplied. An existing blob is never replaced:
    /// a taken key fails with [`NimbusError::Conflict`].
    pub async fn create_file(
        &self,
        storage_key: &str,
        filename: &str,
        mime_type: &str,
        data: &[u8],
        umk: Option<&UserMasterKey>,
    ) -> NimbusResult<FileMetadata> {
        let path = self.blob_path(storage_key)?;

        let encrypted_dek = match umk {
            Some(umk) => {
                let dek = generate_dek();
                let sealed = aead::encrypt(data, dek.as_bytes())?;
                let wrapped = wrap_dek(&dek, umk)?;

                let mut on_disk =
                    Vec::with_capacity(NONCE_SIZE + TAG_SIZE + sealed.ciphertext.len());
                on_disk.extend_from_slice(&sealed.nonce);
                on_disk.extend_from_slice(&sealed.auth_tag);
                on_disk.extend_from_slice(&sealed.ciphertext);
                write_new(&path, &on_disk, storage_key).await?;
                Some(wrapped)
            }
            None => {
                write_new(&path, data, storage_key).await?;
                if self.previews && is_image_mime(mime_type) {
                    self.write_preview(storage_key, data).await;
                }
                None
            }
        };

        info!(
            storage_key,
            size = data.len(),
            encrypted = encrypted_dek.is_some(),
            "blob stored"
        );

        Ok(FileMetadata {
            storage_key: storage_key.to_string(),
            name: filename.to_string(),
            size: data.len() as u64,
            mime_type: mime_type.to_string(),
            encrypted_dek,
        })
    }

    /// Best-effort placeholder generation; failures are logged and ignored.
    async fn write_preview(&self, storage_key: &str, data: &[u8]) {
        let path = match self.preview_path(storage_key) {
            Ok(p) => p,
            Err(e) => {
                warn!(storage_key, "preview skipped: {e}");
                return;
            }
        };
        let owned = data.to_vec();
        let max_dim = self.preview_max_dim;
        let rendered =
            tokio::task::spawn_blocking(move || render_placeholder(&owned, max_dim)).await;

        match rendered {
            Ok(Ok(png)) => {
                if let Err(e) = write_atomic(&path, &png).await {
                    warn!(storage_key, "failed to write preview: {e}");
                } else {
                    debug!(storage_key, bytes = png.len(), "preview written");
                }
            }
            Ok(Err(e)) => warn!(storage_key, "preview generation failed: {e:#}"),
            Err(e) => warn!(storage_key, "preview task failed: {e}"),
        }
    }

    /// Stream the raw bytes of a blob. Each call opens the file anew.
    pub async fn get_file_stream(&self, storage_key: &str) -> NimbusResult<ByteStream> {
        let path = self.blob_path(storage_key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, storage_key))?;
        Ok(Box::pin(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)))
    }

    /// Read, authenticate, and decrypt an encrypted blob.
    ///
    /// The whole blob is buffered: AES-GCM only releases plaintext after the
    /// tag over the full ciphertext verifies.
    pub async fn get_decrypted_file_stream(
        &self,
        storage_key: &str,
        encrypted_dek: &EncryptedBlob,
        umk: &UserMasterKey,
    ) -> NimbusResult<ByteStream> {
        let path = self.blob_path(storage_key)?;
        let raw = fs::read(&path)
            .await
            .map_err(|e| not_found_or_io(e, storage_key))?;

        if raw.len() < NONCE_SIZE + TAG_SIZE {
            warn!(storage_key, len = raw.len(), "encrypted blob shorter than its header");
            return Err(NimbusError::Decryption);
        }
        let (nonce, rest) = raw.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        let sealed = EncryptedBlob {
            ciphertext: ciphertext.to_vec(),
            nonce: nonce.to_vec(),
            auth_tag: tag.to_vec(),
        };

        let dek = unwrap_dek(encrypted_dek, umk)?;
        let plaintext = Bytes::from(aead::decrypt(&sealed, dek.as_bytes())?);
        debug!(storage_key, size = plaintext.len(), "blob decrypted");

        let chunks: Vec<io::Result<Bytes>> = (0..plaintext.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(|start| {
                let end = (start + STREAM_CHUNK_SIZE).min(plaintext.len());
                Ok(plaintext.slice(start..end))
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    /// The preview placeholder for a blob, if one was generated.
    pub async fn get_preview(&self, storage_key: &str) -> NimbusResult<Option<Vec<u8>>> {
        let path = self.preview_path(storage_key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, storage_key: &str) -> NimbusResult<bool> {
        let path = self.blob_path(storage_key)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Remove a blob and its preview. An already-absent blob is success.
    pub async fn delete_file(&self, storage_key: &str) -> NimbusResult<()> {
        let path = self.blob_path(storage_key)?;
        match fs::remove_file(&path).await {
            Ok(()) => debug!(storage_key, "blob deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(storage_key, "blob already absent")
            }
            Err(e) => return Err(e.into()),
        }

        let preview = self.preview_path(storage_key)?;
        if let Err(e) = fs::remove_file(&preview).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(storage_key, "failed to remove preview: {e}");
            }
        }
        Ok(())
    }

    /// Delete many blobs independently, collecting per-item failures.
    pub async fn delete_many(&self, storage_keys: &[String]) -> BatchOutcome {
        let results: Vec<(&String, NimbusResult<()>)> = futures::stream::iter(storage_keys)
            .map(|key| async move { (key, self.delete_file(key).await) })
            .buffer_unordered(self.delete_concurrency)
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (key, result) in results {
            match result {
                Ok(()) => outcome.record_success(),
                Err(e) => {
                    warn!(storage_key = %key, "batch delete item failed: {e}");
                    outcome.record_failure(key, e);
                }
            }
        }
        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failures.len(),
            "batch delete finished"
        );
        outcome
    }

    /// Disk capacity of the storage root plus `user_id`'s recorded usage.
    pub fn storage_status(
        &self,
        records: &dyn RecordStore,
        user_id: &str,
    ) -> NimbusResult<StorageStatus> {
        let total = fs2::total_space(&self.root)?;
        let free = fs2::available_space(&self.root)?;
        let used = records.usage_for(user_id)?;
        Ok(StorageStatus { total, free, used })
    }
}

fn not_found_or_io(e: io::Error, storage_key: &str) -> NimbusError {
    if e.kind() == io::ErrorKind::NotFound {
        NimbusError::NotFound(format!("blob {storage_key}"))
    } else {
        e.into()
    }
}

/// Atomic write: write to a sibling temp file, then rename.
async fn write_atomic(path: &Path, data: &[u8]) -> NimbusResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Write `data` to a private temp file, then hard-link it into place. The
/// link fails if `path` exists, so two writers cannot both claim a key.
async fn write_new(path: &Path, data: &[u8], storage_key: &str) -> NimbusResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_file_name(format!("{storage_key}.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, data).await?;

    let linked = fs::hard_link(&tmp, path).await;
    if let Err(e) = fs::remove_file(&tmp).await {
        warn!(path = %tmp.display(), "failed to remove temp blob: {e}");
    }
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(NimbusError::Conflict(storage_key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::sample_png;
    use crate::records::JsonRecordStore;
    use nimbus_core::FileRecord;
    use nimbus_crypto::generate_umk;

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn plaintext_roundtrip() {
        let (_dir, store) = store().await;
        let meta = store
            .create_file("plain1", "a.txt", "text/plain", b"hello", None)
            .await
            .unwrap();

        assert!(meta.encrypted_dek.is_none());
        assert_eq!(meta.size, 5);
        let bytes = collect(store.get_file_stream("plain1").await.unwrap()).await;
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn encrypted_roundtrip_and_layout() {
        let (_dir, store) = store().await;
        let umk = generate_umk();
        let data = vec![7u8; 200_000];

        let meta = store
            .create_file("enc1", "big.bin", "application/octet-stream", &data, Some(&umk))
            .await
            .unwrap();
        let dek = meta.encrypted_dek.clone().expect("encrypted file carries a DEK");
        assert_eq!(meta.size, data.len() as u64);

        // Raw bytes on disk: nonce ∥ tag ∥ ciphertext, not the plaintext
        let raw = collect(store.get_file_stream("enc1").await.unwrap()).await;
        assert_eq!(raw.len(), NONCE_SIZE + TAG_SIZE + data.len());
        assert_ne!(&raw[NONCE_SIZE + TAG_SIZE..], &data[..]);

        let plain = collect(
            store
                .get_decrypted_file_stream("enc1", &dek, &umk)
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(plain, data);
    }

    #[tokio::test]
    async fn wrong_master_key_fails() {
        let (_dir, store) = store().await;
        let meta = store
            .create_file("enc2", "a.txt", "text/plain", b"secret", Some(&generate_umk()))
            .await
            .unwrap();

        let result = store
            .get_decrypted_file_stream("enc2", meta.encrypted_dek.as_ref().unwrap(), &generate_umk())
            .await;
        assert!(matches!(result, Err(NimbusError::Decryption)));
    }

    #[tokio::test]
    async fn corrupted_blob_fails() {
        let (dir, store) = store().await;
        let umk = generate_umk();
        let meta = store
            .create_file("enc3", "a.txt", "text/plain", b"secret data", Some(&umk))
            .await
            .unwrap();

        let path = dir.path().join("blobs/en/enc3");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        std::fs::write(&path, &raw).unwrap();

        let result = store
            .get_decrypted_file_stream("enc3", meta.encrypted_dek.as_ref().unwrap(), &umk)
            .await;
        assert!(matches!(result, Err(NimbusError::Decryption)));
    }

    #[tokio::test]
    async fn existing_blob_is_never_replaced() {
        let (dir, store) = store().await;
        store
            .create_file("taken", "a.txt", "text/plain", b"first", None)
            .await
            .unwrap();

        let err = store
            .create_file("taken", "b.txt", "text/plain", b"second", Some(&generate_umk()))
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::Conflict(_)));

        let bytes = collect(store.get_file_stream("taken").await.unwrap()).await;
        assert_eq!(bytes, b"first");
        // No temp files left in the shard
        let shard: Vec<_> = std::fs::read_dir(dir.path().join("blobs/ta"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(shard, vec![std::ffi::OsString::from("taken")]);
    }

    #[tokio::test]
    async fn concurrent_creates_claim_key_once() {
        let (_dir, store) = store().await;
        let (a, b) = tokio::join!(
            store.create_file("race", "a", "text/plain", b"aaaa", None),
            store.create_file("race", "b", "text/plain", b"bbbb", None),
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one writer wins");

        let winner: &[u8] = if a.is_ok() { b"aaaa" } else { b"bbbb" };
        let bytes = collect(store.get_file_stream("race").await.unwrap()).await;
        assert_eq!(bytes, winner);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get_file_stream("nope").await,
            Err(NimbusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        store
            .create_file("gone", "a.txt", "text/plain", b"x", None)
            .await
            .unwrap();

        store.delete_file("gone").await.unwrap();
        store.delete_file("gone").await.unwrap();
        assert!(!store.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn batch_delete_collects_failures() {
        let (_dir, store) = store().await;
        for key in ["k1", "k2"] {
            store
                .create_file(key, "f", "text/plain", b"x", None)
                .await
                .unwrap();
        }

        let keys = vec![
            "k1".to_string(),
            "k2".to_string(),
            "missing".to_string(),
            "../bad".to_string(),
        ];
        let outcome = store.delete_many(&keys).await;

        assert_eq!(outcome.succeeded, 3, "a missing blob is not a failure");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].storage_key, "../bad");
    }

    #[tokio::test]
    async fn preview_for_plain_images_only() {
        let (_dir, store) = store().await;
        let png = sample_png(100, 50);

        store
            .create_file("img1", "pic.png", "image/png", &png, None)
            .await
            .unwrap();
        let preview = store.get_preview("img1").await.unwrap().expect("preview written");
        assert!(image::load_from_memory(&preview).unwrap().width() <= 32);

        store
            .create_file("img2", "pic.png", "image/png", &png, Some(&generate_umk()))
            .await
            .unwrap();
        assert!(store.get_preview("img2").await.unwrap().is_none());

        store.delete_file("img1").await.unwrap();
        assert!(store.get_preview("img1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_image_still_stores_blob() {
        let (_dir, store) = store().await;
        let meta = store
            .create_file("img3", "broken.png", "image/png", b"not a png", None)
            .await
            .unwrap();

        assert_eq!(meta.size, 9);
        assert!(store.exists("img3").await.unwrap());
        assert!(store.get_preview("img3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_reports_user_usage() {
        let (_dir, store) = store().await;
        let records = JsonRecordStore::in_memory();
        let meta = store
            .create_file("u1", "a.txt", "text/plain", b"12345", None)
            .await
            .unwrap();
        records
            .insert(FileRecord::from_metadata(meta, "alice"))
            .unwrap();

        let status = store.storage_status(&records, "alice").unwrap();
        assert_eq!(status.used, 5);
        assert!(status.total >= status.free);
        assert_eq!(store.storage_status(&records, "bob").unwrap().used, 0);
    }
}
