//! Vault service: request-level operations over one storage root

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use nimbus_core::config::NimbusConfig;
use nimbus_core::{BatchOutcome, FileRecord, NimbusError, NimbusResult, StorageStatus};
use nimbus_crypto::{
    CredentialStore, JsonCredentialStore, KdfParams, KeyHierarchy, SessionKeyCache,
    SessionState, UserMasterKey,
};
use nimbus_multipart::{parse_multipart_stream, ParsedUpload, ParserLimits, UploadCallbacks};
use nimbus_storage::{BlobStore, ByteStream, JsonRecordStore, RecordStore};
use secrecy::SecretString;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Form field carrying one relative path per uploaded file, in file order.
pub const RELATIVE_PATHS_FIELD: &str = "relativePaths";
/// Form field naming the destination folder.
pub const FOLDER_ID_FIELD: &str = "folderId";

/// A file ready to be served.
pub struct Download {
    pub record: FileRecord,
    pub stream: ByteStream,
}

pub struct Vault {
    blobs: BlobStore,
    records: Arc<dyn RecordStore>,
    keys: Arc<KeyHierarchy>,
    limits: ParserLimits,
}

impl Vault {
    pub fn new(
        blobs: BlobStore,
        records: Arc<dyn RecordStore>,
        keys: Arc<KeyHierarchy>,
        limits: ParserLimits,
    ) -> Self {
        Self {
            blobs,
            records,
            keys,
            limits,
        }
    }

    /// Open the blob store, record index and credential store named in `config`.
    pub async fn open(config: &NimbusConfig) -> NimbusResult<Self> {
        let blobs = BlobStore::from_config(&config.storage, &config.upload).await?;
        let records: Arc<dyn RecordStore> =
            Arc::new(JsonRecordStore::open(&config.storage.records_file)?);
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(JsonCredentialStore::open(&config.storage.credentials_file)?);
        let sessions = Arc::new(SessionKeyCache::new(Duration::from_secs(
            config.crypto.session_ttl_secs,
        )));
        let keys = Arc::new(KeyHierarchy::new(
            credentials,
            sessions,
            KdfParams::from(&config.crypto),
        ));

        info!(root = %config.storage.root.display(), "vault opened");
        Ok(Self::new(
            blobs,
            records,
            keys,
            ParserLimits::from(&config.upload),
        ))
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn keys(&self) -> &Arc<KeyHierarchy> {
        &self.keys
    }

    // ── Credentials and sessions ─────────────────────────────────────────

    pub async fn register(&self, user_id: &str, password: SecretString) -> NimbusResult<()> {
        let keys = self.keys.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || keys.register(&user_id, &password).map(|_| ()))
            .await
            .map_err(join_error)?
    }

    /// Unlock `session_id` for `user_id`. Argon2id runs off the async workers.
    pub async fn restore_access(
        &self,
        session_id: &str,
        user_id: &str,
        password: SecretString,
    ) -> NimbusResult<()> {
        let keys = self.keys.clone();
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            keys.restore_umk(&session_id, &user_id, &password).map(|_| ())
        })
        .await
        .map_err(join_error)?
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        old_password: SecretString,
        new_password: SecretString,
    ) -> NimbusResult<()> {
        let keys = self.keys.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            keys.change_password(&user_id, &old_password, &new_password)
        })
        .await
        .map_err(join_error)?
    }

    /// Evict the session's key. Returns whether the session was unlocked.
    pub fn lock(&self, session_id: &str) -> bool {
        self.keys.lock(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> SessionState {
        self.keys.session_state(session_id)
    }

    /// Periodically drop expired session keys.
    pub fn spawn_session_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let sessions = self.keys.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = sessions.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "expired session keys evicted");
                }
            }
        })
    }

    // ── Files ────────────────────────────────────────────────────────────

    /// Parse a multipart body and store every file part for `owner_id`.
    ///
    /// Files are encrypted iff `session_id` is unlocked at the start of the
    /// request. Staged parts are always removed before returning.
    pub async fn upload<S>(
        &self,
        session_id: &str,
        owner_id: &str,
        content_type: Option<&str>,
        body: Option<S>,
        callbacks: &mut UploadCallbacks<'_>,
    ) -> NimbusResult<Vec<FileRecord>>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let umk = self.keys.sessions().get(session_id);
        let parsed = parse_multipart_stream(
            content_type,
            body,
            self.blobs.staging_dir(),
            &self.limits,
            callbacks,
        )
        .await?;

        let result = self.finalize(&parsed, owner_id, umk.as_deref()).await;
        for file in &parsed.files {
            remove_staged(&file.path).await;
        }
        let records = result?;

        info!(
            owner_id,
            files = records.len(),
            encrypted = umk.is_some(),
            "upload finalized"
        );
        Ok(records)
    }

    async fn finalize(
        &self,
        parsed: &ParsedUpload,
        owner_id: &str,
        umk: Option<&UserMasterKey>,
    ) -> NimbusResult<Vec<FileRecord>> {
        let relative_paths = parsed.field_values(RELATIVE_PATHS_FIELD);
        let folder_id = parsed.field(FOLDER_ID_FIELD).filter(|id| !id.is_empty());

        // Storage keys are immutable: refuse the whole request before writing anything
        for staged in &parsed.files {
            if self.records.get(&staged.storage_key)?.is_some()
                || self.blobs.exists(&staged.storage_key).await?
            {
                warn!(storage_key = %staged.storage_key, owner_id, "upload names a taken storage key");
                return Err(NimbusError::Conflict(staged.storage_key.clone()));
            }
        }

        let mut records = Vec::with_capacity(parsed.files.len());
        for (index, staged) in parsed.files.iter().enumerate() {
            let data = tokio::fs::read(&staged.path).await?;
            let meta = self
                .blobs
                .create_file(
                    &staged.storage_key,
                    &staged.name,
                    &staged.mime_type,
                    &data,
                    umk,
                )
                .await?;

            let mut record = FileRecord::from_metadata(meta, owner_id);
            record.folder_id = folder_id.map(str::to_string);
            record.relative_path = relative_paths.get(index).cloned();
            self.records.insert(record.clone())?;
            records.push(record);
        }
        Ok(records)
    }

    /// Open one of `owner_id`'s files for reading.
    ///
    /// Whether to decrypt is decided by the record's wrapped DEK only; an
    /// encrypted file needs an unlocked session. Another user's file is
    /// reported as not found.
    pub async fn download(
        &self,
        session_id: &str,
        owner_id: &str,
        storage_key: &str,
    ) -> NimbusResult<Download> {
        let record = self
            .records
            .get(storage_key)?
            .filter(|r| r.owner_id == owner_id)
            .ok_or_else(|| NimbusError::NotFound(format!("file {storage_key}")))?;

        let stream = match &record.encrypted_dek {
            None => self.blobs.get_file_stream(storage_key).await?,
            Some(dek) => {
                let umk = self.keys.require_umk(session_id)?;
                self.blobs
                    .get_decrypted_file_stream(storage_key, dek, &umk)
                    .await?
            }
        };
        debug!(storage_key, encrypted = record.is_encrypted(), "download opened");
        Ok(Download { record, stream })
    }

    /// Delete `owner_id`'s blobs, then their records. A record is kept when
    /// its blob could not be removed, so the delete can be retried. Keys
    /// owned by another user fail without being touched.
    pub async fn delete_files(&self, owner_id: &str, storage_keys: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut owned = Vec::with_capacity(storage_keys.len());
        for key in storage_keys {
            match self.deletable(owner_id, key).await {
                Ok(true) => owned.push(key.clone()),
                Ok(false) => outcome.record_success(),
                Err(e) => {
                    warn!(storage_key = %key, owner_id, "delete refused: {e}");
                    outcome.record_failure(key, e);
                }
            }
        }

        let deleted = self.blobs.delete_many(&owned).await;
        let failed: HashSet<String> = deleted
            .failures
            .iter()
            .map(|f| f.storage_key.clone())
            .collect();
        outcome.failures.extend(deleted.failures);

        for key in owned.iter().filter(|k| !failed.contains(k.as_str())) {
            match self.records.remove(key) {
                Ok(_) => outcome.record_success(),
                Err(e) => {
                    warn!(storage_key = %key, "failed to remove file record: {e}");
                    outcome.record_failure(key, e);
                }
            }
        }
        outcome
    }

    /// Whether `storage_key` should be deleted for `owner_id`. `Ok(false)`
    /// means there is nothing left to delete.
    async fn deletable(&self, owner_id: &str, storage_key: &str) -> NimbusResult<bool> {
        match self.records.get(storage_key)? {
            Some(record) if record.owner_id == owner_id => Ok(true),
            Some(_) => Err(NimbusError::NotFound(format!("file {storage_key}"))),
            // A blob nobody owns is left to failed-upload cleanup
            None if self.blobs.exists(storage_key).await? => {
                Err(NimbusError::NotFound(format!("file {storage_key}")))
            }
            None => Ok(false),
        }
    }

    /// Reconcile uploads the client reports as failed: remove any staged
    /// part, blob and record for each key. Keys owned by another user fail.
    pub async fn cleanup_failed_uploads(
        &self,
        owner_id: &str,
        storage_keys: &[String],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for key in storage_keys {
            match self.cleanup_one(owner_id, key).await {
                Ok(()) => outcome.record_success(),
                Err(e) => {
                    warn!(storage_key = %key, "failed-upload cleanup: {e}");
                    outcome.record_failure(key, e);
                }
            }
        }
        info!(
            owner_id,
            cleaned = outcome.succeeded,
            failed = outcome.failures.len(),
            "failed uploads reconciled"
        );
        outcome
    }

    async fn cleanup_one(&self, owner_id: &str, storage_key: &str) -> NimbusResult<()> {
        let record = self.records.get(storage_key)?;
        if let Some(record) = &record {
            if record.owner_id != owner_id {
                return Err(NimbusError::NotFound(format!("file {storage_key}")));
            }
        }

        let staged = self.blobs.staged_path(storage_key)?;
        match tokio::fs::remove_file(&staged).await {
            Ok(()) => debug!(storage_key, "removed staged part"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.blobs.delete_file(storage_key).await?;
        if record.is_some() {
            self.records.remove(storage_key)?;
        }
        Ok(())
    }

    pub fn storage_status(&self, user_id: &str) -> NimbusResult<StorageStatus> {
        self.blobs.storage_status(self.records.as_ref(), user_id)
    }
}

fn join_error(e: JoinError) -> NimbusError {
    NimbusError::Crypto(format!("key derivation task failed: {e}"))
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove staged part: {e}"),
    }
}
