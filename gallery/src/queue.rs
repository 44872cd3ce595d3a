//! Ordered collection of gallery images and their uploads.
//!
//! ```text
//!              upload_one            ok
//!   Pending ---------------> Uploading ----> Uploaded
//!                              |    ^
//!           3 attempts failed  |    | retry
//!                              v    |
//!                              Failed
//! ```
//!
//! Entries are kept sorted by `order`, which always runs `0..len` without
//! gaps. Only add, remove, reorder and hydrate change `order`; upload
//! completion never does.

use futures::StreamExt;
use payloads::requests::InlineImage;
use payloads::responses::UploadedImage;
use payloads::{ALLOWED_IMAGE_TYPES, ClientError, ImageId, VillaId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::telemetry::log_error;
use crate::{LocalFile, MediaBackend, PreviewUrls, ProgressSink, QueueConfig};

/// Identity of a queue entry, stable across re-renders and reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    /// Added from a local file during this session.
    Local(u64),
    /// Hydrated from an image the backend already knows.
    Backend(ImageId),
    /// Hydrated from an image without a known server id, by position.
    Positional(usize),
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(n) => write!(f, "local-{n}"),
            Self::Backend(id) => write!(f, "backend-{id}"),
            Self::Positional(i) => write!(f, "existing-{i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// One image in the queue.
#[derive(Debug, Clone)]
pub struct AttachmentEntry {
    pub id: EntryId,
    /// Local bytes, dropped once the upload succeeds.
    pub source: Option<LocalFile>,
    /// Preview handle before upload, server URL after.
    pub display_url: String,
    pub order: usize,
    /// Unset until the first upload attempt.
    pub upload_progress: Option<u8>,
    pub upload_error: Option<String>,
    pub is_uploaded: bool,
    pub server_id: Option<ImageId>,
    preview: Option<String>,
    uploading: bool,
}

impl AttachmentEntry {
    pub fn status(&self) -> EntryStatus {
        if self.is_uploaded {
            EntryStatus::Uploaded
        } else if self.uploading {
            EntryStatus::Uploading
        } else if self.upload_error.is_some() {
            EntryStatus::Failed
        } else {
            EntryStatus::Pending
        }
    }

    /// Preview handle this entry owns, if it was added from a local file.
    pub fn preview_handle(&self) -> Option<&str> {
        self.preview.as_deref()
    }

    fn needs_upload(&self) -> bool {
        !self.is_uploaded && !self.uploading && self.source.is_some()
    }
}

/// Why a single file was refused by `add_files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    UnsupportedType(String),
    TooLarge { size: usize, max: usize },
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType(content_type) => write!(
                f,
                "unsupported file type '{content_type}', expected one of: {}",
                ALLOWED_IMAGE_TYPES.join(", ")
            ),
            Self::TooLarge { size, max } => write!(
                f,
                "file is too large ({:.1}MB), maximum size is {:.1}MB",
                *size as f64 / 1_048_576.0,
                *max as f64 / 1_048_576.0
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{file}: {reason}")]
    Validation {
        file: String,
        reason: ValidationFailure,
    },
    #[error(
        "Cannot add {adding} image(s): the gallery holds {current} of at \
         most {max}"
    )]
    Capacity {
        current: usize,
        adding: usize,
        max: usize,
    },
    #[error("Image {0} is not in the gallery")]
    NotFound(EntryId),
    #[error("Image {0} has no local file to upload")]
    NoSource(EntryId),
    #[error("Image {0} is already uploading")]
    AlreadyUploading(EntryId),
    #[error("Uploading image {id} failed: {message}")]
    UploadFailed { id: EntryId, message: String },
    #[error("Image {0} has not failed")]
    NotFailed(EntryId),
    #[error("Index {index} is out of bounds for a gallery of {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error("Could not delete image {id} from the server")]
    Delete {
        id: EntryId,
        #[source]
        source: ClientError,
    },
    #[error("Uploading image {id} failed after {attempts} attempt(s)")]
    Upload {
        id: EntryId,
        attempts: u32,
        #[source]
        source: ClientError,
    },
}

/// Files accepted and errors raised by one `add_files` call.
#[derive(Debug, Default)]
pub struct AddFilesReport {
    pub added: Vec<EntryId>,
    /// One `Validation` error per refused file, plus a `Capacity` error if
    /// the whole batch was refused.
    pub errors: Vec<QueueError>,
}

/// Some uploads in a batch failed after exhausting their attempts.
#[derive(Debug, thiserror::Error)]
#[error("{} of {attempted} image upload(s) failed", failed.len())]
pub struct PartialUpload {
    pub attempted: usize,
    /// Server URLs of the uploads that succeeded, in gallery order.
    pub uploaded_urls: Vec<String>,
    pub failed: Vec<(EntryId, String)>,
}

impl PartialUpload {
    pub fn is_total_failure(&self) -> bool {
        self.uploaded_urls.is_empty()
    }
}

enum Settled {
    Done(Result<String, QueueError>),
    /// Uploaded, but the entry was removed meanwhile.
    Orphaned(UploadedImage),
}

#[derive(Default)]
struct QueueState {
    entries: Vec<AttachmentEntry>,
    next_local: u64,
}

impl QueueState {
    fn find(&self, id: EntryId) -> Option<&AttachmentEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    fn find_mut(&mut self, id: EntryId) -> Option<&mut AttachmentEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    fn renumber(&mut self) {
        for (order, entry) in self.entries.iter_mut().enumerate() {
            entry.order = order;
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct UploadQueue<B> {
    backend: B,
    config: QueueConfig,
    owner: Option<VillaId>,
    previews: PreviewUrls,
    state: Arc<Mutex<QueueState>>,
    /// Woken whenever an upload settles.
    settled: Notify,
}

impl<B: MediaBackend> UploadQueue<B> {
    pub fn new(backend: B, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            owner: None,
            previews: PreviewUrls::new(),
            state: Arc::default(),
            settled: Notify::new(),
        }
    }

    /// Attach uploads to an existing villa.
    pub fn with_owner(mut self, villa_id: VillaId) -> Self {
        self.owner = Some(villa_id);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn previews(&self) -> &PreviewUrls {
        &self.previews
    }

    /// Snapshot of all entries, sorted by `order`.
    pub fn entries(&self) -> Vec<AttachmentEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn get(&self, id: EntryId) -> Option<AttachmentEntry> {
        lock(&self.state).find(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that still have to be uploaded, including failed ones.
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .entries
            .iter()
            .filter(|entry| !entry.is_uploaded)
            .count()
    }

    pub fn failed(&self) -> Vec<AttachmentEntry> {
        lock(&self.state)
            .entries
            .iter()
            .filter(|entry| entry.status() == EntryStatus::Failed)
            .cloned()
            .collect()
    }

    /// Local images in gallery order, for sending inline with a villa that
    /// does not exist yet. Entries already on the server are skipped.
    pub fn inline_images(&self) -> Vec<InlineImage> {
        lock(&self.state)
            .entries
            .iter()
            .filter_map(|entry| entry.source.as_ref())
            .map(LocalFile::to_inline_image)
            .collect()
    }

    fn validate(&self, file: &LocalFile) -> Result<(), QueueError> {
        let allowed = ALLOWED_IMAGE_TYPES.contains(&file.content_type.as_str());
        let reason = if !allowed {
            ValidationFailure::UnsupportedType(file.content_type.clone())
        } else if file.size() > self.config.max_file_bytes {
            ValidationFailure::TooLarge {
                size: file.size(),
                max: self.config.max_file_bytes,
            }
        } else {
            return Ok(());
        };
        Err(QueueError::Validation {
            file: file.name.clone(),
            reason,
        })
    }

    /// Validate `files` one by one and append the valid ones as pending
    /// entries. If the valid files would push the gallery over its maximum
    /// size, none of them are added.
    pub fn add_files(&self, files: Vec<LocalFile>) -> AddFilesReport {
        let mut report = AddFilesReport::default();
        let mut valid = Vec::with_capacity(files.len());
        for file in files {
            match self.validate(&file) {
                Ok(()) => valid.push(file),
                Err(e) => {
                    tracing::warn!("Rejected image: {e}");
                    report.errors.push(e);
                }
            }
        }

        let mut state = lock(&self.state);
        let current = state.entries.len();
        if current + valid.len() > self.config.max_files {
            let e = QueueError::Capacity {
                current,
                adding: valid.len(),
                max: self.config.max_files,
            };
            tracing::warn!("{e}");
            report.errors.push(e);
            return report;
        }

        for file in valid {
            let id = EntryId::Local(state.next_local);
            state.next_local += 1;
            let preview = self.previews.create(&file);
            let order = state.entries.len();
            state.entries.push(AttachmentEntry {
                id,
                source: Some(file),
                display_url: preview.clone(),
                order,
                upload_progress: None,
                upload_error: None,
                is_uploaded: false,
                server_id: None,
                preview: Some(preview),
                uploading: false,
            });
            report.added.push(id);
        }
        tracing::debug!(added = report.added.len(), "Added images to gallery");
        report
    }

    /// Remove an entry. Entries the server knows about are deleted there
    /// first; if that fails the entry stays in the queue untouched. Entries
    /// with an upload in flight cannot be removed until it settles.
    #[tracing::instrument(skip(self))]
    pub async fn remove_entry(&self, id: EntryId) -> Result<(), QueueError> {
        let server_id = {
            let state = lock(&self.state);
            let entry = state.find(id).ok_or(QueueError::NotFound(id))?;
            if entry.uploading {
                return Err(QueueError::AlreadyUploading(id));
            }
            entry.server_id
        };

        if let Some(server_id) = server_id {
            self.backend
                .delete_attachment(server_id)
                .await
                .map_err(|source| QueueError::Delete { id, source })?;
        }

        let mut state = lock(&self.state);
        let index = state
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(QueueError::NotFound(id))?;
        let entry = state.entries.remove(index);
        state.renumber();
        drop(state);

        if let Some(handle) = &entry.preview {
            self.previews.release(handle);
        }
        Ok(())
    }

    /// Move the entry at `from` to position `to`.
    pub fn reorder(&self, from: usize, to: usize) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        let len = state.entries.len();
        for index in [from, to] {
            if index >= len {
                return Err(QueueError::OutOfBounds { index, len });
            }
        }
        let entry = state.entries.remove(from);
        state.entries.insert(to, entry);
        state.renumber();
        Ok(())
    }

    /// Drop every entry and release their previews.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut lock(&self.state).entries);
        self.release_previews(&entries);
    }

    /// Replace the queue with images already stored on the server.
    ///
    /// Entries take their id from `server_ids[i]` when present so identity
    /// survives reloads; otherwise, or when a server id repeats, they fall
    /// back to a positional id.
    pub fn hydrate_existing(
        &self,
        urls: &[String],
        server_ids: &[Option<ImageId>],
    ) {
        let mut seen = HashSet::new();
        let hydrated: Vec<AttachmentEntry> = urls
            .iter()
            .enumerate()
            .map(|(order, url)| {
                let server_id = server_ids.get(order).copied().flatten();
                let id = match server_id {
                    Some(server_id) if seen.insert(server_id) => {
                        EntryId::Backend(server_id)
                    }
                    _ => EntryId::Positional(order),
                };
                AttachmentEntry {
                    id,
                    source: None,
                    display_url: url.clone(),
                    order,
                    upload_progress: None,
                    upload_error: None,
                    is_uploaded: true,
                    server_id,
                    preview: None,
                    uploading: false,
                }
            })
            .collect();

        let replaced =
            std::mem::replace(&mut lock(&self.state).entries, hydrated);
        self.release_previews(&replaced);
    }

    fn release_previews(&self, entries: &[AttachmentEntry]) {
        let handles = entries.iter().filter_map(|entry| entry.preview.as_ref());
        for handle in handles {
            self.previews.release(handle);
        }
    }

    fn progress_sink(&self, id: EntryId) -> ProgressSink {
        let state = Arc::clone(&self.state);
        Arc::new(move |percent| {
            if let Some(entry) = lock(&state).find_mut(id) {
                entry.upload_progress = Some(percent.min(100));
            }
        })
    }

    /// Upload one entry, making up to `upload_attempts` attempts. Returns
    /// the server URL.
    #[tracing::instrument(skip(self))]
    pub async fn upload_one(&self, id: EntryId) -> Result<String, QueueError> {
        let file = {
            let mut state = lock(&self.state);
            let entry = state.find_mut(id).ok_or(QueueError::NotFound(id))?;
            if entry.uploading {
                return Err(QueueError::AlreadyUploading(id));
            }
            if entry.is_uploaded {
                return Ok(entry.display_url.clone());
            }
            let file = entry.source.clone().ok_or(QueueError::NoSource(id))?;
            entry.uploading = true;
            entry.upload_error = None;
            entry.upload_progress = Some(0);
            file
        };

        let attempts = self.config.upload_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            let progress = self.progress_sink(id);
            match self
                .backend
                .upload_attachment(&file, self.owner, progress)
                .await
            {
                Ok(uploaded) => break Ok(uploaded),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        attempt,
                        "Upload of {id} failed, retrying: {e}"
                    );
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        let settled = self.record_upload(id, attempt, result);
        self.settled.notify_waiters();
        match settled {
            Settled::Done(outcome) => outcome,
            Settled::Orphaned(uploaded) => {
                // Nothing local refers to this image any more.
                tracing::warn!("Image {id} was removed while uploading");
                let deleted = self.backend.delete_attachment(uploaded.id).await;
                if let Err(e) = deleted {
                    log_error(anyhow::Error::new(e).context(format!(
                        "Could not delete orphaned image {}",
                        uploaded.id
                    )));
                }
                Err(QueueError::NotFound(id))
            }
        }
    }

    fn record_upload(
        &self,
        id: EntryId,
        attempts: u32,
        result: Result<UploadedImage, ClientError>,
    ) -> Settled {
        let mut state = lock(&self.state);
        let Some(entry) = state.find_mut(id) else {
            return match result {
                Ok(uploaded) => Settled::Orphaned(uploaded),
                Err(_) => Settled::Done(Err(QueueError::NotFound(id))),
            };
        };
        entry.uploading = false;
        Settled::Done(match result {
            Ok(uploaded) => {
                entry.display_url = uploaded.url.clone();
                entry.server_id = Some(uploaded.id);
                entry.is_uploaded = true;
                entry.source = None;
                entry.upload_error = None;
                entry.upload_progress = Some(100);
                tracing::info!(server_id = %uploaded.id, "Uploaded {id}");
                Ok(uploaded.url)
            }
            Err(source) => {
                entry.upload_error = Some(source.to_string());
                tracing::error!(
                    attempts,
                    "Upload of {id} failed: {source}"
                );
                Err(QueueError::Upload {
                    id,
                    attempts,
                    source,
                })
            }
        })
    }

    /// Wait for an upload started elsewhere to settle and report how it went.
    async fn wait_settled(&self, id: EntryId) -> Result<String, QueueError> {
        loop {
            // Registered before checking, so a settle in between still wakes
            // us.
            let notified = self.settled.notified();
            {
                let state = lock(&self.state);
                let entry = state.find(id).ok_or(QueueError::NotFound(id))?;
                if entry.is_uploaded {
                    return Ok(entry.display_url.clone());
                }
                if !entry.uploading {
                    return Err(QueueError::UploadFailed {
                        id,
                        message: entry
                            .upload_error
                            .clone()
                            .unwrap_or_else(|| "upload did not finish".into()),
                    });
                }
            }
            notified.await;
        }
    }

    /// Upload a failed entry again on request.
    pub async fn retry(&self, id: EntryId) -> Result<String, QueueError> {
        let status = self
            .get(id)
            .map(|entry| entry.status())
            .ok_or(QueueError::NotFound(id))?;
        if status != EntryStatus::Failed {
            return Err(QueueError::NotFailed(id));
        }
        self.upload_one(id).await
    }

    /// Upload every entry that is not uploaded yet, up to
    /// `upload_concurrency` at a time, and wait for all of them to settle.
    ///
    /// Entries already uploading elsewhere are not sent again; their running
    /// upload is awaited and counted in the result. Returns the server URLs
    /// in gallery order, or which uploads failed alongside the URLs that
    /// succeeded.
    #[tracing::instrument(skip(self))]
    pub async fn upload_all_pending(
        &self,
    ) -> Result<Vec<String>, PartialUpload> {
        let batch: Vec<EntryId> = lock(&self.state)
            .entries
            .iter()
            .filter(|entry| entry.needs_upload() || entry.uploading)
            .map(|entry| entry.id)
            .collect();
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let limit = match self.config.upload_concurrency {
            0 => batch.len(),
            n => n,
        };
        tracing::info!(count = batch.len(), limit, "Uploading pending images");
        let mut results: HashMap<EntryId, Result<String, QueueError>> =
            futures::stream::iter(batch.iter().copied())
                .map(|id| async move {
                    let result = match self.upload_one(id).await {
                        Err(QueueError::AlreadyUploading(_)) => {
                            self.wait_settled(id).await
                        }
                        result => result,
                    };
                    (id, result)
                })
                .buffer_unordered(limit)
                .collect()
                .await;

        let mut uploaded_urls = Vec::new();
        let mut failed = Vec::new();
        for id in &batch {
            match results.remove(id) {
                Some(Ok(url)) => uploaded_urls.push(url),
                Some(Err(e)) => failed.push((*id, e.to_string())),
                None => failed.push((*id, "upload did not run".to_string())),
            }
        }

        if failed.is_empty() {
            Ok(uploaded_urls)
        } else {
            Err(PartialUpload {
                attempted: batch.len(),
                uploaded_urls,
                failed,
            })
        }
    }
}
