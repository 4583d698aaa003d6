//! The capability set every storage backend implements.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::header::HeaderMap;

use crate::error::DriverError;

/// Boxed future returned by the async driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Converts raw bytes to an uploadable image and back.
///
/// Drivers encode inside [`Driver::upload`]; the download side only needs
/// [`decode`](ImageCodec::decode) to recover the payload from a fetched body.
pub trait ImageCodec: Send + Sync {
    /// Short identifier of the codec.
    fn name(&self) -> &str;

    /// Wraps `data` into an image body.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, DriverError>;

    /// Recovers the payload from an image body.
    fn decode(&self, image: &[u8]) -> Result<Vec<u8>, DriverError>;
}

/// Identity codec for backends that accept arbitrary bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl ImageCodec for PassthroughCodec {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, DriverError> {
        Ok(data.to_vec())
    }

    fn decode(&self, image: &[u8]) -> Result<Vec<u8>, DriverError> {
        Ok(image.to_vec())
    }
}

/// A pluggable storage backend.
///
/// Implementations must not require callers to know anything about the
/// shape of their URLs: meta links go through [`meta_to_real`] and
/// [`real_to_meta`], block URLs are treated as opaque strings.
///
/// [`meta_to_real`]: Driver::meta_to_real
/// [`real_to_meta`]: Driver::real_to_meta
pub trait Driver: Send + Sync {
    /// Stable machine name, used as the credential key and source key.
    fn name(&self) -> &str;

    /// Human readable name for logs and reports.
    fn display_name(&self) -> &str;

    /// Headers to attach to every GET against this backend.
    fn headers(&self) -> HeaderMap;

    /// Codec used to decode bodies fetched from this backend.
    fn codec(&self) -> Arc<dyn ImageCodec>;

    /// Translates a meta link to the URL the meta object can be fetched from.
    ///
    /// Returns `None` if the link does not belong to this driver.
    fn meta_to_real(&self, link: &str) -> Option<String>;

    /// Translates a stored object's URL to the shareable meta link.
    fn real_to_meta(&self, url: &str) -> String;

    /// Stores `data` and returns its locator.
    fn upload<'a>(
        &'a self,
        data: &'a [u8],
        http: &'a reqwest::Client,
        credential: &'a str,
        checksum: &'a str,
    ) -> DriverFuture<'a, String>;

    /// Checks whether `credential` is accepted by the backend.
    fn check_credential<'a>(
        &'a self,
        http: &'a reqwest::Client,
        credential: &'a str,
    ) -> DriverFuture<'a, bool>;
}
