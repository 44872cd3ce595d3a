use bytes::Bytes;
use mime_guess::MimeGuess;
use payloads::requests::InlineImage;
use std::path::Path;

/// Raw bytes of an image picked locally, not yet uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl LocalFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, detecting its type from its contents and
    /// falling back to its extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image")
            .to_string();
        let content_type = detect_content_type(path, &data);
        Ok(Self::new(name, content_type, data))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The file embedded in a request that creates a villa.
    pub fn to_inline_image(&self) -> InlineImage {
        InlineImage::new(&self.name, &self.content_type, &self.data)
    }
}

impl std::fmt::Debug for LocalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFile")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.data.len())
            .finish()
    }
}

fn detect_content_type(path: &Path, data: &[u8]) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }
    MimeGuess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}
