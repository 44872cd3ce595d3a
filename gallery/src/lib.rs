//! Image gallery management for villa listings.
//!
//! [`UploadQueue`] owns the ordered set of images attached to a listing while
//! it is being edited, and uploads them to the backend. The
//! [`SubmissionCoordinator`] sequences a save of the listing on top of it:
//!
//! ```text
//! upload pending images -> assign thumbnail -> persist listing -> done
//! ```

pub mod backend;
pub mod config;
pub mod file;
pub mod preview;
pub mod queue;
pub mod submission;
pub mod telemetry;

pub use backend::{MediaBackend, ProgressSink};
pub use config::{Config, ConfigError, QueueConfig, SubmissionConfig};
pub use file::LocalFile;
pub use preview::PreviewUrls;
pub use queue::{
    AddFilesReport, AttachmentEntry, EntryId, EntryStatus, PartialUpload,
    QueueError, UploadQueue, ValidationFailure,
};
pub use submission::{
    StepId, StepStatus, SubmissionCoordinator, SubmissionFlow,
    SubmissionOutcome, SubmissionPhase, SubmissionProgress, SubmissionStep,
    SubmitError, is_transient,
};
