//! In-memory stand-ins for the villa backend.
//!
//! Both mocks are cheap to clone; clones share state so a test can keep a
//! handle for inspection after giving one to the code under test.

use gallery::{LocalFile, MediaBackend, ProgressSink};
use payloads::responses::UploadedImage;
use payloads::{ClientError, ImageId, VillaId};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Image ids handed out by [`MockBackend`] start after this.
const FIRST_IMAGE_ID: i64 = 100;

#[derive(Default)]
struct BackendState {
    issued: i64,
    /// Remaining scripted failures per file name.
    upload_failures: HashMap<String, u32>,
    upload_attempts: HashMap<String, u32>,
    upload_owners: Vec<Option<VillaId>>,
    failing_deletes: HashSet<ImageId>,
    deleted: Vec<ImageId>,
    fail_thumbnail: bool,
    thumbnails: Vec<(VillaId, ImageId)>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    fn image_url(image_id: ImageId) -> String {
        format!("https://cdn.villas.test/images/{image_id}.jpg")
    }

    /// Fail the next `times` uploads of `file_name`.
    pub fn fail_uploads(&self, file_name: &str, times: u32) {
        self.state()
            .upload_failures
            .insert(file_name.to_string(), times);
    }

    /// Fail every upload of `file_name`.
    pub fn always_fail_uploads(&self, file_name: &str) {
        self.fail_uploads(file_name, u32::MAX);
    }

    pub fn fail_delete(&self, image_id: ImageId) {
        self.state().failing_deletes.insert(image_id);
    }

    pub fn fail_thumbnail(&self) {
        self.state().fail_thumbnail = true;
    }

    pub fn upload_attempts(&self, file_name: &str) -> u32 {
        self.state()
            .upload_attempts
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_upload_attempts(&self) -> u32 {
        self.state().upload_attempts.values().sum()
    }

    pub fn upload_owners(&self) -> Vec<Option<VillaId>> {
        self.state().upload_owners.clone()
    }

    pub fn deleted(&self) -> Vec<ImageId> {
        self.state().deleted.clone()
    }

    pub fn thumbnails(&self) -> Vec<(VillaId, ImageId)> {
        self.state().thumbnails.clone()
    }
}

impl MediaBackend for MockBackend {
    async fn upload_attachment(
        &self,
        file: &LocalFile,
        owner: Option<VillaId>,
        progress: ProgressSink,
    ) -> Result<UploadedImage, ClientError> {
        progress(50);
        // Let other uploads in the same batch make progress.
        tokio::task::yield_now().await;

        let image_id = {
            let mut state = self.state();
            *state.upload_attempts.entry(file.name.clone()).or_default() += 1;
            state.upload_owners.push(owner);
            if let Some(remaining) = state.upload_failures.get_mut(&file.name)
                && *remaining > 0
            {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(ClientError::APIError(
                    StatusCode::BAD_GATEWAY,
                    format!("Upload of {} failed", file.name),
                ));
            }
            state.issued += 1;
            ImageId(FIRST_IMAGE_ID + state.issued)
        };

        progress(100);
        Ok(UploadedImage {
            id: image_id,
            url: Self::image_url(image_id),
        })
    }

    async fn delete_attachment(
        &self,
        image_id: ImageId,
    ) -> Result<(), ClientError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.failing_deletes.contains(&image_id) {
            return Err(ClientError::APIError(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not delete image {image_id}"),
            ));
        }
        state.deleted.push(image_id);
        Ok(())
    }

    async fn set_thumbnail(
        &self,
        villa_id: VillaId,
        image_id: ImageId,
    ) -> Result<(), ClientError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.fail_thumbnail {
            return Err(ClientError::APIError(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Thumbnail update failed".into(),
            ));
        }
        state.thumbnails.push((villa_id, image_id));
        Ok(())
    }
}

struct PersistState<S> {
    script: VecDeque<Result<S, (StatusCode, String)>>,
    calls: Vec<Instant>,
}

/// A persist function that plays back scripted results in order and
/// records when it was called.
#[derive(Clone)]
pub struct ScriptedPersist<S> {
    state: Arc<Mutex<PersistState<S>>>,
}

impl<S> Default for ScriptedPersist<S> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(PersistState {
                script: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }
}

impl<S> ScriptedPersist<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, saved: S) -> Self {
        self.state.lock().unwrap().script.push_back(Ok(saved));
        self
    }

    pub fn then_fail(self, status: StatusCode, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(Err((status, message.to_string())));
        self
    }

    /// Pops the next scripted result. Unscripted calls fail with a 400 so
    /// they are never retried.
    pub async fn call(&self) -> Result<S, ClientError> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Instant::now());
            state.script.pop_front()
        };
        tokio::task::yield_now().await;
        match next {
            Some(Ok(saved)) => Ok(saved),
            Some(Err((status, message))) => {
                Err(ClientError::APIError(status, message))
            }
            None => Err(ClientError::APIError(
                StatusCode::BAD_REQUEST,
                "unscripted persist call".into(),
            )),
        }
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Time elapsed between consecutive calls.
    pub fn gaps(&self) -> Vec<std::time::Duration> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}
