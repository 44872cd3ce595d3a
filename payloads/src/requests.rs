use crate::{ImageId, VillaDetails};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

/// An image sent inline with a new villa, before the villa has an id that
/// standalone uploads could be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub file_name: String,
    pub content_type: String,
    /// Image bytes, base64 encoded with the standard alphabet.
    pub image_data: String,
}

impl InlineImage {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: &[u8],
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            image_data: general_purpose::STANDARD.encode(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVilla {
    #[serde(flatten)]
    pub details: VillaDetails,
    pub images: Vec<InlineImage>,
    /// Index into `images` of the primary image. The first image is used when
    /// unset.
    pub thumbnail_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetThumbnail {
    pub image_id: ImageId,
}
