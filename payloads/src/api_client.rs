use crate::{ImageId, VillaDetails, VillaId, requests, responses};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;

type ReqwestResult = Result<reqwest::Response, reqwest::Error>;

/// Size of each body chunk when streaming an image upload. Progress is
/// reported once per chunk.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Attaches credentials to outgoing requests.
///
/// The client never looks up credentials itself; whoever builds the client
/// decides how requests are signed.
pub trait RequestSigner: Send + Sync {
    fn sign(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder;
}

/// Sends requests without credentials.
pub struct Unsigned;

impl RequestSigner for Unsigned {
    fn sign(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        request
    }
}

/// Signs requests with an `Authorization: Bearer` header.
pub struct BearerToken(SecretString);

impl BearerToken {
    pub fn new(token: SecretString) -> Self {
        Self(token)
    }
}

impl RequestSigner for BearerToken {
    fn sign(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        request.bearer_auth(self.0.expose_secret())
    }
}

/// An API client for interfacing with the villa backend.
pub struct APIClient {
    pub address: String,
    pub inner_client: reqwest::Client,
    pub signer: Arc<dyn RequestSigner>,
}

impl APIClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().trim_end_matches('/').to_string(),
            inner_client: reqwest::Client::new(),
            signer: Arc::new(Unsigned),
        }
    }

    pub fn with_signer(mut self, signer: impl RequestSigner + 'static) -> Self {
        self.signer = Arc::new(signer);
        self
    }
}

/// Helper methods for http actions
impl APIClient {
    fn format_url(&self, path: &str) -> String {
        format!("{}/api/{path}", &self.address)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.inner_client.request(method, self.format_url(path));
        self.signer.sign(request)
    }

    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: &impl Serialize,
    ) -> ReqwestResult {
        self.request(method, path).json(body).send().await
    }

    async fn send_empty(&self, method: Method, path: &str) -> ReqwestResult {
        self.request(method, path).send().await
    }
}

/// Methods on the backend API
impl APIClient {
    pub async fn health_check(&self) -> Result<(), ClientError> {
        let response = self.send_empty(Method::GET, "health_check").await?;
        ok_empty(response).await
    }

    pub async fn get_villa(
        &self,
        villa_id: &VillaId,
    ) -> Result<responses::Villa, ClientError> {
        let path = format!("villas/{villa_id}");
        let response = self.send_empty(Method::GET, &path).await?;
        ok_body(response).await
    }

    /// Create a villa together with its images in a single request.
    pub async fn create_villa(
        &self,
        details: &requests::CreateVilla,
    ) -> Result<responses::Villa, ClientError> {
        let response = self.send_json(Method::POST, "villas", details).await?;
        ok_body(response).await
    }

    /// Partially update a villa's details.
    pub async fn update_villa(
        &self,
        villa_id: &VillaId,
        details: &VillaDetails,
    ) -> Result<responses::Villa, ClientError> {
        let path = format!("villas/{villa_id}");
        let response = self.send_json(Method::PATCH, &path, details).await?;
        ok_body(response).await
    }

    /// Upload a single image, streaming the body in [`UPLOAD_CHUNK_SIZE`]
    /// chunks. `on_progress` receives the percentage of the body handed to
    /// the transport so far.
    ///
    /// Images uploaded without a villa are held by the backend until a villa
    /// claims them.
    pub async fn upload_villa_image<F>(
        &self,
        villa_id: Option<&VillaId>,
        file_name: &str,
        content_type: &str,
        data: Bytes,
        on_progress: F,
    ) -> Result<responses::UploadedImage, ClientError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let path = match villa_id {
            Some(villa_id) => format!("villas/{villa_id}/images"),
            None => "images".to_string(),
        };
        let total = data.len();
        let mut sent = 0;
        let chunks = split_chunks(data, UPLOAD_CHUNK_SIZE).into_iter().map(
            move |chunk| {
                sent += chunk.len();
                on_progress(percent(sent, total));
                Ok::<_, std::io::Error>(chunk)
            },
        );
        let response = self
            .request(Method::POST, &path)
            .header(CONTENT_TYPE, content_type)
            .header("X-File-Name", file_name)
            .body(reqwest::Body::wrap_stream(futures::stream::iter(chunks)))
            .send()
            .await?;
        ok_body(response).await
    }

    pub async fn delete_villa_image(
        &self,
        image_id: &ImageId,
    ) -> Result<(), ClientError> {
        let path = format!("images/{image_id}");
        let response = self.send_empty(Method::DELETE, &path).await?;
        ok_empty(response).await
    }

    /// Mark one of the villa's images as its primary image.
    pub async fn set_villa_thumbnail(
        &self,
        villa_id: &VillaId,
        details: &requests::SetThumbnail,
    ) -> Result<(), ClientError> {
        let path = format!("villas/{villa_id}/thumbnail");
        let response = self.send_json(Method::PUT, &path, details).await?;
        ok_empty(response).await
    }
}

fn split_chunks(mut data: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
    while data.len() > chunk_size {
        chunks.push(data.split_to(chunk_size));
    }
    chunks.push(data);
    chunks
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) * 100) / total) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An unhandled API error to display, containing response text.
    #[error("{1}")]
    APIError(StatusCode, String),
    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),
}

impl ClientError {
    /// HTTP status of the failed response, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::APIError(status, _) => Some(*status),
            Self::Network(e) => e.status(),
        }
    }
}

/// Deserialize a successful request into the desired type, or return an
/// appropriate error.
pub async fn ok_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(response.json::<T>().await?)
}

/// Check that an empty response is OK, returning a ClientError if not.
pub async fn ok_empty(response: reqwest::Response) -> Result<(), ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(())
}
