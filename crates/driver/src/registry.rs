//! Driver lookup and meta link parsing.

use std::io::BufRead;
use std::sync::Arc;

use tracing::debug;

use crate::driver::Driver;
use crate::{BATCH_END_SENTINEL, SOURCE_SEPARATOR};

/// The set of drivers known to this process.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a driver. A later driver with the same name replaces the earlier one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.retain(|d| d.name() != driver.name());
        self.drivers.push(driver);
    }

    /// Returns the driver registered under `name`.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.name() == name).cloned()
    }

    /// Returns the first driver that accepts `link` as one of its meta links.
    pub fn by_meta_link(&self, link: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|d| d.meta_to_real(link).is_some())
            .cloned()
    }

    /// All registered drivers, in registration order.
    pub fn drivers(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Splits a `+`-joined source list into recognised, normalised meta links.
    ///
    /// Unrecognised pieces are dropped.
    pub fn parse_source_line(&self, line: &str) -> Vec<String> {
        line.split(SOURCE_SEPARATOR)
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .filter_map(|piece| {
                let driver = self.by_meta_link(piece)?;
                let real = driver.meta_to_real(piece)?;
                Some(driver.real_to_meta(&real))
            })
            .collect()
    }

    /// Reads batch input: one source list per line until EOF or a line
    /// reading `end`.
    ///
    /// Lines without any recognised link are skipped.
    pub fn read_batch_links<R: BufRead>(&self, reader: R) -> std::io::Result<Vec<Vec<String>>> {
        let mut groups = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line == BATCH_END_SENTINEL {
                break;
            }
            let sources = self.parse_source_line(line);
            if sources.is_empty() {
                debug!(line, "no recognised link on batch line");
                continue;
            }
            groups.push(sources);
        }
        Ok(groups)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.drivers.iter().map(|d| d.name()))
            .finish()
    }
}
