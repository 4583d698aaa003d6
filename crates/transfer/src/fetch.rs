//! Retrieval of stored objects.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::HeaderMap;
use tracing::trace;

use crate::TransferError;

/// Boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Fetches the raw (still encoded) body stored at a URL.
///
/// Deadlines are applied by the caller.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, headers: HeaderMap) -> FetchFuture<'a>;
}

/// [`Fetcher`] over plain HTTP(S) GET.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, headers: HeaderMap) -> FetchFuture<'a> {
        Box::pin(async move {
            let resp = self
                .http
                .get(url)
                .headers(headers)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(TransferError::UnexpectedStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let body = resp.bytes().await?;
            trace!(url, len = body.len(), "fetched object");
            if body.is_empty() {
                return Err(TransferError::EmptyBody(url.to_string()));
            }
            Ok(body.to_vec())
        })
    }
}

/// Rewrites a leading `http://` to `https://` when `force` is set.
pub fn force_https(url: &str, force: bool) -> String {
    match url.strip_prefix("http://") {
        Some(rest) if force => format!("https://{rest}"),
        _ => url.to_string(),
    }
}
