//! Storage driver contract for CDNDrive.
//!
//! A driver stores opaque byte blobs on some third-party image host and
//! hands back a locator for them. The transfer engine talks to every
//! backend through [`Driver`] alone and never branches on which concrete
//! service is behind it.
//!
//! Besides the contract itself this crate provides:
//!
//! - [`DriverRegistry`] to resolve user-supplied meta links to drivers,
//!   including `+`-joined redundant source lists and batch input.
//! - [`CredentialStore`], the per-driver credential file shared by all
//!   uploads of one process.

pub mod credentials;
pub mod driver;
pub mod error;
pub mod registry;

pub use credentials::{CredentialStore, config_dir, default_credentials_path};
pub use driver::{Driver, DriverFuture, ImageCodec, PassthroughCodec};
pub use error::{CredentialError, DriverError};
pub use registry::DriverRegistry;

/// Line that terminates interactive batch link input.
pub const BATCH_END_SENTINEL: &str = "end";

/// Separator between redundant sources of the same file.
pub const SOURCE_SEPARATOR: char = '+';
