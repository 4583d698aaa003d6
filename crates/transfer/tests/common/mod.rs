//! In-memory backend shared by the engine tests.
//!
//! `MemoryDriver` stores uploads in a [`BlobStore`]; `MemoryFetcher` serves
//! them back and can be told to fail specific URLs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cdndrive_driver::{
    CredentialStore, Driver, DriverError, DriverFuture, DriverRegistry, ImageCodec,
};
use cdndrive_transfer::fetch::FetchFuture;
use cdndrive_transfer::{
    Fetcher, FileDescriptor, Source, SourcePicker, SourceSet, TransferConfig, TransferError,
};
use rand::rngs::StdRng;
use reqwest::header::{HeaderMap, HeaderValue};

const IMAGE_TAG: &[u8] = b"IMG0";

/// Codec that tags payloads, so undecodable bodies are detectable.
pub struct TagCodec;

impl ImageCodec for TagCodec {
    fn name(&self) -> &str {
        "tag"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, DriverError> {
        let mut out = IMAGE_TAG.to_vec();
        out.extend_from_slice(data);
        Ok(out)
    }

    fn decode(&self, image: &[u8]) -> Result<Vec<u8>, DriverError> {
        image
            .strip_prefix(IMAGE_TAG)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DriverError::Codec("missing image tag".into()))
    }
}

#[derive(Clone, Default)]
pub struct BlobStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
}

impl BlobStore {
    fn put(&self, driver: &str, body: Vec<u8>) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let url = format!("mem://{driver}/{}", inner.next_id);
        inner.blobs.insert(url.clone(), body);
        url
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().blobs.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }
}

pub struct MemoryDriver {
    name: String,
    display_name: String,
    store: BlobStore,
    required_credential: Option<String>,
    fail_uploads: AtomicBool,
    panic_uploads: AtomicBool,
}

impl MemoryDriver {
    pub fn new(name: &str, store: &BlobStore) -> Self {
        Self {
            name: name.to_string(),
            display_name: format!("Memory {name}"),
            store: store.clone(),
            required_credential: None,
            fail_uploads: AtomicBool::new(false),
            panic_uploads: AtomicBool::new(false),
        }
    }

    pub fn requiring(mut self, credential: &str) -> Self {
        self.required_credential = Some(credential.to_string());
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_uploads.store(failing, Ordering::SeqCst);
    }

    pub fn set_panicking(&self, panicking: bool) {
        self.panic_uploads.store(panicking, Ordering::SeqCst);
    }

    fn credential_ok(&self, credential: &str) -> bool {
        self.required_credential
            .as_deref()
            .is_none_or(|required| required == credential)
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.name) {
            headers.insert("x-memory-driver", value);
        }
        headers
    }

    fn codec(&self) -> Arc<dyn ImageCodec> {
        Arc::new(TagCodec)
    }

    fn meta_to_real(&self, link: &str) -> Option<String> {
        let id = link.strip_prefix(&format!("{}://", self.name))?;
        Some(format!("mem://{}/{id}", self.name))
    }

    fn real_to_meta(&self, url: &str) -> String {
        match url.strip_prefix(&format!("mem://{}/", self.name)) {
            Some(id) => format!("{}://{id}", self.name),
            None => url.to_string(),
        }
    }

    fn upload<'a>(
        &'a self,
        data: &'a [u8],
        _http: &'a reqwest::Client,
        credential: &'a str,
        checksum: &'a str,
    ) -> DriverFuture<'a, String> {
        Box::pin(async move {
            if self.panic_uploads.load(Ordering::SeqCst) {
                panic!("{} crashed mid-upload", self.name);
            }
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(DriverError::Rejected("backend unavailable".into()));
            }
            if !self.credential_ok(credential) {
                return Err(DriverError::Credential("wrong credential".into()));
            }
            if checksum.len() != 40 {
                return Err(DriverError::Rejected("missing checksum".into()));
            }
            let body = TagCodec.encode(data)?;
            Ok(self.store.put(&self.name, body))
        })
    }

    fn check_credential<'a>(
        &'a self,
        _http: &'a reqwest::Client,
        credential: &'a str,
    ) -> DriverFuture<'a, bool> {
        Box::pin(async move { Ok(self.credential_ok(credential)) })
    }
}

/// Injected fetch failure for one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Serve the body with its last byte flipped.
    Corrupt,
    /// Fail with a server error.
    Unavailable,
    /// Serve a body the codec cannot decode.
    Garbage,
    /// Panic inside the fetch.
    Panic,
}

#[derive(Default)]
pub struct MemoryFetcher {
    store: BlobStore,
    faults: Mutex<HashMap<String, Fault>>,
    fetches: Mutex<HashMap<String, u32>>,
}

impl MemoryFetcher {
    pub fn new(store: &BlobStore) -> Self {
        Self {
            store: store.clone(),
            ..Default::default()
        }
    }

    pub fn fail(&self, url: &str, fault: Fault) {
        self.faults.lock().unwrap().insert(url.to_string(), fault);
    }

    pub fn heal(&self, url: &str) {
        self.faults.lock().unwrap().remove(url);
    }

    /// Number of fetches of `url` so far.
    pub fn fetch_count(&self, url: &str) -> u32 {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Total fetches of every URL in `urls`.
    pub fn total_fetches<'a>(&self, urls: impl IntoIterator<Item = &'a str>) -> u32 {
        urls.into_iter().map(|u| self.fetch_count(u)).sum()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch<'a>(&'a self, url: &'a str, _headers: HeaderMap) -> FetchFuture<'a> {
        Box::pin(async move {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default() += 1;
            let fault = self.faults.lock().unwrap().get(url).copied();
            let body = self
                .store
                .get(url)
                .ok_or_else(|| TransferError::UnexpectedStatus {
                    url: url.to_string(),
                    status: 404,
                })?;
            match fault {
                None => Ok(body),
                Some(Fault::Corrupt) => {
                    let mut body = body;
                    if let Some(last) = body.last_mut() {
                        *last ^= 0xff;
                    }
                    Ok(body)
                }
                Some(Fault::Unavailable) => Err(TransferError::UnexpectedStatus {
                    url: url.to_string(),
                    status: 503,
                }),
                Some(Fault::Garbage) => Ok(b"not an image".to_vec()),
                Some(Fault::Panic) => panic!("fetcher crashed on {url}"),
            }
        })
    }
}

/// Tries the candidates of a block in turn, one per attempt.
pub struct RoundRobinPicker;

impl SourcePicker for RoundRobinPicker {
    fn pick<'s>(
        &self,
        set: &'s SourceSet,
        block_index: usize,
        attempt: u32,
        _rng: &mut StdRng,
    ) -> Option<&'s Source> {
        let candidates = set.candidates(block_index);
        if candidates.is_empty() {
            return None;
        }
        set.sources()
            .get(candidates[(block_index + attempt as usize) % candidates.len()])
    }
}

pub fn registry(drivers: &[Arc<MemoryDriver>]) -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    for driver in drivers {
        registry.register(Arc::clone(driver) as Arc<dyn Driver>);
    }
    registry
}

pub fn config(output_dir: &Path, block_size: u64) -> TransferConfig {
    TransferConfig {
        block_size,
        output_dir: output_dir.to_path_buf(),
        rng_seed: Some(42),
        ..Default::default()
    }
}

pub fn credentials(dir: &Path) -> CredentialStore {
    CredentialStore::open(dir.join("credentials.conf"))
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Reads back the meta object behind `link`.
pub fn descriptor(store: &BlobStore, driver: &MemoryDriver, link: &str) -> FileDescriptor {
    let real = driver.meta_to_real(link).unwrap();
    let body = store.get(&real).unwrap();
    FileDescriptor::from_json(&TagCodec.decode(&body).unwrap()).unwrap()
}
