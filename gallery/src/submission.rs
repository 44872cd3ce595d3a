//! Multi-step save of a villa listing.
//!
//! ```text
//! upload  ---> thumbnail ---> (consistency wait) ---> persist ---> done
//!   |                                                   |  ^
//!   | no image uploaded                       transient |  | backoff
//!   v                                                   v  |
//! error                                              retry -+
//! ```
//!
//! Steps run one after another; each moves through
//! `pending -> in progress -> completed | error`. Progress is published on a
//! watch channel so a progress overlay can follow along.

use payloads::{ClientError, ImageId, VillaId};
use reqwest::StatusCode;
use std::future::Future;
use tokio::sync::watch;

use crate::queue::{AttachmentEntry, EntryId, PartialUpload, UploadQueue};
use crate::{MediaBackend, SubmissionConfig, telemetry::log_error};

/// Whole words in an error message that signal lock contention.
const LOCK_KEYWORDS: &[&str] =
    &["lock", "locks", "locked", "deadlock", "deadlocked", "busy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepId {
    Upload,
    Thumbnail,
    Persist,
}

impl StepId {
    pub fn label(self) -> &'static str {
        match self {
            Self::Upload => "Uploading images",
            Self::Thumbnail => "Setting thumbnail",
            Self::Persist => "Saving villa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionStep {
    pub id: StepId,
    pub label: &'static str,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Running,
    Done,
    Failed,
}

/// Everything a progress display needs to render a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionProgress {
    pub phase: SubmissionPhase,
    pub steps: Vec<SubmissionStep>,
    pub error: Option<String>,
}

impl SubmissionProgress {
    fn fresh(phase: SubmissionPhase) -> Self {
        let steps = [StepId::Upload, StepId::Thumbnail, StepId::Persist]
            .into_iter()
            .map(|id| SubmissionStep {
                id,
                label: id.label(),
                status: StepStatus::Pending,
            })
            .collect();
        Self {
            phase,
            steps,
            error: None,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&SubmissionStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Percentage of completed steps.
    pub fn percent(&self) -> u8 {
        let completed = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count();
        (completed * 100 / self.steps.len().max(1)) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFlow {
    /// New villa; images travel inside the persist payload.
    Create,
    /// Existing villa; pending images are uploaded first.
    Edit {
        villa_id: VillaId,
        current_thumbnail: Option<ImageId>,
    },
}

#[derive(Debug)]
pub struct SubmissionOutcome<S> {
    pub saved: S,
    /// Entry chosen as the thumbnail, if the gallery is not empty.
    pub thumbnail: Option<EntryId>,
    /// Uploads that failed while others succeeded.
    pub partial_upload: Option<PartialUpload>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("None of the images could be uploaded")]
    Uploads(#[source] PartialUpload),
    #[error("Saving the villa failed after {attempts} attempt(s)")]
    Persist {
        attempts: u32,
        #[source]
        source: ClientError,
    },
}

/// Whether a persist failure is worth retrying: lock contention reported by
/// the backend, or a generic server error.
pub fn is_transient(error: &ClientError) -> bool {
    let generic_server_error = matches!(
        error.status(),
        Some(
            StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
        )
    );
    let message = error.to_string().to_lowercase();
    generic_server_error
        || message
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| LOCK_KEYWORDS.contains(&word))
}

/// The chosen entry if it resolves, otherwise the first entry by order.
fn resolve_thumbnail(
    entries: &[AttachmentEntry],
    choice: Option<EntryId>,
) -> Option<&AttachmentEntry> {
    choice
        .and_then(|id| entries.iter().find(|entry| entry.id == id))
        .or_else(|| entries.iter().min_by_key(|entry| entry.order))
}

pub struct SubmissionCoordinator {
    config: SubmissionConfig,
    progress: watch::Sender<SubmissionProgress>,
}

impl SubmissionCoordinator {
    pub fn new(config: SubmissionConfig) -> Self {
        let (progress, _) =
            watch::channel(SubmissionProgress::fresh(SubmissionPhase::Idle));
        Self { config, progress }
    }

    pub fn subscribe(&self) -> watch::Receiver<SubmissionProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SubmissionProgress {
        self.progress.borrow().clone()
    }

    /// Message of the step that failed the last submission.
    pub fn error(&self) -> Option<String> {
        self.progress.borrow().error.clone()
    }

    fn set_step(&self, id: StepId, status: StepStatus) {
        self.progress.send_modify(|progress| {
            if let Some(step) = progress.steps.iter_mut().find(|s| s.id == id) {
                step.status = status;
            }
        });
    }

    fn fail_step(&self, id: StepId, message: String) {
        tracing::error!(step = ?id, "Submission failed: {message}");
        self.progress.send_modify(|progress| {
            if let Some(step) = progress.steps.iter_mut().find(|s| s.id == id) {
                step.status = StepStatus::Error;
            }
            progress.phase = SubmissionPhase::Failed;
            progress.error = Some(message);
        });
    }

    /// Save `record`: upload pending images, assign the thumbnail, then
    /// persist through `persist`, retrying transient failures with
    /// exponential backoff.
    #[tracing::instrument(skip_all, fields(flow = ?flow))]
    pub async fn submit<B, R, S, P, Fut>(
        &self,
        flow: SubmissionFlow,
        record: &R,
        queue: &UploadQueue<B>,
        thumbnail_choice: Option<EntryId>,
        mut persist: P,
    ) -> Result<SubmissionOutcome<S>, SubmitError>
    where
        B: MediaBackend,
        P: FnMut(&R) -> Fut,
        Fut: Future<Output = Result<S, ClientError>>,
    {
        self.progress
            .send_replace(SubmissionProgress::fresh(SubmissionPhase::Running));

        let partial_upload = self.upload_step(flow, queue).await?;
        let thumbnail =
            self.thumbnail_step(flow, queue, thumbnail_choice).await;
        // Works around the backend not reading its own thumbnail write
        // immediately. It narrows the race rather than closing it.
        tokio::time::sleep(self.config.consistency_delay).await;
        let saved = self.persist_step(record, &mut persist).await?;

        tokio::time::sleep(self.config.completion_hold).await;
        self.progress.send_modify(|progress| {
            progress.phase = SubmissionPhase::Done;
        });
        tracing::info!("Submission complete");

        Ok(SubmissionOutcome {
            saved,
            thumbnail,
            partial_upload,
        })
    }

    async fn upload_step<B: MediaBackend>(
        &self,
        flow: SubmissionFlow,
        queue: &UploadQueue<B>,
    ) -> Result<Option<PartialUpload>, SubmitError> {
        self.set_step(StepId::Upload, StepStatus::InProgress);
        let outcome = match flow {
            SubmissionFlow::Edit { .. } if queue.pending_count() > 0 => {
                queue.upload_all_pending().await
            }
            _ => Ok(Vec::new()),
        };

        match outcome {
            Ok(_) => {
                self.set_step(StepId::Upload, StepStatus::Completed);
                Ok(None)
            }
            Err(partial) if partial.is_total_failure() => {
                self.fail_step(StepId::Upload, partial.to_string());
                Err(SubmitError::Uploads(partial))
            }
            Err(partial) => {
                tracing::warn!(
                    "Continuing with {} uploaded image(s): {partial}",
                    partial.uploaded_urls.len()
                );
                self.set_step(StepId::Upload, StepStatus::Completed);
                Ok(Some(partial))
            }
        }
    }

    /// Failures here are logged and do not stop the submission.
    async fn thumbnail_step<B: MediaBackend>(
        &self,
        flow: SubmissionFlow,
        queue: &UploadQueue<B>,
        choice: Option<EntryId>,
    ) -> Option<EntryId> {
        self.set_step(StepId::Thumbnail, StepStatus::InProgress);
        let entries = queue.entries();
        let target = resolve_thumbnail(&entries, choice);

        if let SubmissionFlow::Edit {
            villa_id,
            current_thumbnail,
        } = flow
            && let Some(server_id) = target.and_then(|entry| entry.server_id)
            && current_thumbnail != Some(server_id)
        {
            match queue.backend().set_thumbnail(villa_id, server_id).await {
                Ok(()) => {
                    tracing::info!(%villa_id, %server_id, "Thumbnail updated");
                }
                Err(e) => log_error(anyhow::Error::new(e).context(format!(
                    "Setting thumbnail {server_id} on villa {villa_id} failed"
                ))),
            }
        }

        self.set_step(StepId::Thumbnail, StepStatus::Completed);
        target.map(|entry| entry.id)
    }

    async fn persist_step<R, S, P, Fut>(
        &self,
        record: &R,
        persist: &mut P,
    ) -> Result<S, SubmitError>
    where
        P: FnMut(&R) -> Fut,
        Fut: Future<Output = Result<S, ClientError>>,
    {
        self.set_step(StepId::Persist, StepStatus::InProgress);
        let attempts = self.config.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            match persist(record).await {
                Ok(saved) => {
                    self.set_step(StepId::Persist, StepStatus::Completed);
                    return Ok(saved);
                }
                Err(e) if attempt < attempts && is_transient(&e) => {
                    let delay =
                        self.config.backoff_base * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        ?delay,
                        "Transient failure saving villa, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    self.fail_step(StepId::Persist, source.to_string());
                    return Err(SubmitError::Persist {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
