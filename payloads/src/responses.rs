use crate::{ImageId, VillaDetails, VillaId};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Result of a standalone image upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub id: ImageId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillaImage {
    pub id: ImageId,
    pub url: String,
    /// Zero-based display position within the gallery.
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Villa {
    pub id: VillaId,
    #[serde(flatten)]
    pub details: VillaDetails,
    pub images: Vec<VillaImage>,
    pub thumbnail_image_id: Option<ImageId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Villa {
    /// Gallery images sorted by display position.
    pub fn sorted_images(&self) -> Vec<&VillaImage> {
        let mut images: Vec<&VillaImage> = self.images.iter().collect();
        images.sort_by_key(|image| image.position);
        images
    }
}
