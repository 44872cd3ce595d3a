use payloads::{APIClient, BearerToken, MAX_IMAGE_SIZE};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Limits and retry settings for an [`UploadQueue`](crate::UploadQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of images a gallery may hold. Call sites editing a
    /// small gallery may lower this (e.g. to 5).
    pub max_files: usize,
    /// Per-file size ceiling in bytes.
    pub max_file_bytes: usize,
    /// Upload attempts per image before the entry is marked failed.
    pub upload_attempts: u32,
    /// Maximum concurrent uploads in `upload_all_pending`; 0 is unbounded.
    pub upload_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_file_bytes: MAX_IMAGE_SIZE,
            upload_attempts: 3,
            upload_concurrency: 4,
        }
    }
}

impl QueueConfig {
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }
}

/// Timing and retry settings for a
/// [`SubmissionCoordinator`](crate::SubmissionCoordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionConfig {
    /// Attempts at persisting the record, including the first.
    pub persist_attempts: u32,
    /// Wait before the second persist attempt; doubled for each later one.
    pub backoff_base: Duration,
    /// Pause between the thumbnail step and the persist step so the
    /// backend's thumbnail write is visible to the persist call.
    pub consistency_delay: Duration,
    /// How long the fully completed state stays visible before the
    /// submission reports done.
    pub completion_hold: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            persist_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            consistency_delay: Duration::from_millis(500),
            completion_hold: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

pub struct Config {
    /// Base address of the villa backend, e.g. `https://admin.example.com`
    pub backend_url: String,
    /// Bearer token attached to every request, if set.
    pub api_token: Option<SecretString>,
    pub queue: QueueConfig,
    pub submission: SubmissionConfig,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// - `GALLERY_BACKEND_URL` (required)
    /// - `GALLERY_API_TOKEN`
    /// - `GALLERY_MAX_FILES` (default 20)
    /// - `GALLERY_MAX_FILE_BYTES` (default 10 MiB)
    /// - `GALLERY_UPLOAD_CONCURRENCY` (default 4, 0 for unbounded)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let backend_url = var("GALLERY_BACKEND_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing {
                name: "GALLERY_BACKEND_URL",
            })?;
        let api_token = var("GALLERY_API_TOKEN")
            .filter(|token| !token.is_empty())
            .map(SecretString::from);

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            max_files: parse_or(&var, "GALLERY_MAX_FILES", defaults.max_files)?,
            max_file_bytes: parse_or(
                &var,
                "GALLERY_MAX_FILE_BYTES",
                defaults.max_file_bytes,
            )?,
            upload_concurrency: parse_or(
                &var,
                "GALLERY_UPLOAD_CONCURRENCY",
                defaults.upload_concurrency,
            )?,
            ..defaults
        };

        Ok(Config {
            backend_url,
            api_token,
            queue,
            submission: SubmissionConfig::default(),
        })
    }

    /// Build an API client for the configured backend, signing requests
    /// with the configured token.
    pub fn api_client(&self) -> APIClient {
        let client = APIClient::new(self.backend_url.clone());
        match &self.api_token {
            Some(token) => client.with_signer(BearerToken::new(
                SecretString::from(token.expose_secret().to_string()),
            )),
            None => client,
        }
    }
}

fn parse_or(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}
