//! Local preview handles for images that have not been uploaded yet.
//!
//! A handle stands in for the image until the backend returns a URL. Each
//! handle holds on to the image bytes, so it must be released once the queue
//! entry owning it goes away.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::LocalFile;

const HANDLE_PREFIX: &str = "blob:villa-gallery/";

struct Preview {
    content_type: String,
    data: Bytes,
}

#[derive(Default)]
pub struct PreviewUrls {
    live: Mutex<HashMap<String, Preview>>,
}

impl PreviewUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new handle for `file`.
    pub fn create(&self, file: &LocalFile) -> String {
        let handle = format!("{HANDLE_PREFIX}{}", Uuid::new_v4());
        self.live().insert(
            handle.clone(),
            Preview {
                content_type: file.content_type.clone(),
                data: file.data.clone(),
            },
        );
        handle
    }

    /// A `data:` URL with the image contents, for rendering.
    pub fn resolve(&self, handle: &str) -> Option<String> {
        self.live().get(handle).map(|preview| {
            format!(
                "data:{};base64,{}",
                preview.content_type,
                general_purpose::STANDARD.encode(&preview.data)
            )
        })
    }

    /// Free a handle. Returns false if it was not live.
    pub fn release(&self, handle: &str) -> bool {
        let released = self.live().remove(handle).is_some();
        if !released {
            tracing::warn!(
                handle,
                "Released a preview handle that was not live"
            );
        }
        released
    }

    pub fn is_live(&self, handle: &str) -> bool {
        self.live().contains_key(handle)
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Preview>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
