pub mod api_client;
pub mod requests;
pub mod responses;

pub use api_client::{
    APIClient, BearerToken, ClientError, RequestSigner, Unsigned,
};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum size of a single villa image, in bytes.
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

/// Image MIME types the backend accepts for villa galleries.
pub const ALLOWED_IMAGE_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/webp", "image/gif"];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct VillaId(pub i64);

/// Server-side identifier of an uploaded villa image.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct ImageId(pub i64);

/// Editable fields of a villa listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillaDetails {
    pub name: String,
    pub description: Option<String>,
    pub price_per_night: Decimal,
    /// Number of guests the villa sleeps.
    pub capacity: u32,
}
