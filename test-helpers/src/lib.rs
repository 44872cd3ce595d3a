//! Scripted collaborators and fixtures for exercising the gallery crate
//! without a backend.

pub mod mock;

pub use mock::{MockBackend, ScriptedPersist};

use gallery::{LocalFile, telemetry};
use payloads::VillaDetails;
use rust_decimal::Decimal;
use tracing_log::LogTracer;
use tracing_subscriber::util::SubscriberInitExt;

pub const MB: usize = 1024 * 1024;

/// Route test logs through the gallery's subscriber. Safe to call from
/// every test; only the first call installs it.
///
/// Set `RUST_LOG` to see more than errors.
pub fn init_test_logs() {
    let subscriber = telemetry::get_subscriber("error".into());
    let _ = LogTracer::init();
    let _ = subscriber.try_init();
}

pub fn image_file(name: &str, content_type: &str, size: usize) -> LocalFile {
    LocalFile::new(name, content_type, vec![0xAB; size])
}

/// A small valid JPEG-typed file.
pub fn jpeg(name: &str) -> LocalFile {
    image_file(name, "image/jpeg", 4 * 1024)
}

pub fn png(name: &str) -> LocalFile {
    image_file(name, "image/png", 4 * 1024)
}

pub fn text_file(name: &str) -> LocalFile {
    image_file(name, "text/plain", 128)
}

pub fn villa_details() -> VillaDetails {
    VillaDetails {
        name: "Villa Azur".into(),
        description: Some("Sea view, private pool".into()),
        price_per_night: Decimal::new(32000, 2),
        capacity: 6,
    }
}
