//! Network collaborators used by the queue and the coordinator.
//!
//! None of these retry on their own. Retries are applied by the caller.

use payloads::responses::UploadedImage;
use payloads::{APIClient, ClientError, ImageId, VillaId, requests};
use std::future::Future;
use std::sync::Arc;

use crate::LocalFile;

/// Receives upload progress as a percentage (0-100).
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

pub trait MediaBackend {
    /// Upload one image, attached to `owner` when the villa already exists.
    /// Called once per attempt.
    fn upload_attachment(
        &self,
        file: &LocalFile,
        owner: Option<VillaId>,
        progress: ProgressSink,
    ) -> impl Future<Output = Result<UploadedImage, ClientError>>;

    fn delete_attachment(
        &self,
        image_id: ImageId,
    ) -> impl Future<Output = Result<(), ClientError>>;

    /// Mark `image_id` as the primary image of `villa_id`.
    fn set_thumbnail(
        &self,
        villa_id: VillaId,
        image_id: ImageId,
    ) -> impl Future<Output = Result<(), ClientError>>;
}

impl<T: MediaBackend + ?Sized> MediaBackend for &T {
    fn upload_attachment(
        &self,
        file: &LocalFile,
        owner: Option<VillaId>,
        progress: ProgressSink,
    ) -> impl Future<Output = Result<UploadedImage, ClientError>> {
        (**self).upload_attachment(file, owner, progress)
    }

    fn delete_attachment(
        &self,
        image_id: ImageId,
    ) -> impl Future<Output = Result<(), ClientError>> {
        (**self).delete_attachment(image_id)
    }

    fn set_thumbnail(
        &self,
        villa_id: VillaId,
        image_id: ImageId,
    ) -> impl Future<Output = Result<(), ClientError>> {
        (**self).set_thumbnail(villa_id, image_id)
    }
}

impl MediaBackend for APIClient {
    async fn upload_attachment(
        &self,
        file: &LocalFile,
        owner: Option<VillaId>,
        progress: ProgressSink,
    ) -> Result<UploadedImage, ClientError> {
        self.upload_villa_image(
            owner.as_ref(),
            &file.name,
            &file.content_type,
            file.data.clone(),
            move |percent| progress(percent),
        )
        .await
    }

    async fn delete_attachment(
        &self,
        image_id: ImageId,
    ) -> Result<(), ClientError> {
        self.delete_villa_image(&image_id).await
    }

    async fn set_thumbnail(
        &self,
        villa_id: VillaId,
        image_id: ImageId,
    ) -> Result<(), ClientError> {
        let request = requests::SetThumbnail { image_id };
        self.set_villa_thumbnail(&villa_id, &request).await
    }
}
