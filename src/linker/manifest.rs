use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::linker::{Chunk, LinkError};

pub const MANIFEST: &str = "manifest.json";

/// Where to find the bundle of an entrypoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// File name of the entrypoint chunk, relative to the bundle directory.
    pub file: String,
    /// Chunks the entrypoint chunk loads before it starts.
    pub loads: Vec<String>,
}

/// Maps every entrypoint specifier to its output files.
///
/// Chunk names change with their content, so pages embedding the bundles
/// are expected to look them up here.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entrypoints: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut manifest = Self::new();

        for chunk in chunks {
            if let Some(entry) = &chunk.entrypoint {
                manifest.register(&entry.specifier, chunk.file_name(), chunk.loads.clone());
            }
        }

        manifest
    }

    pub fn register(
        &mut self,
        specifier: impl Into<String>,
        file: impl Into<String>,
        loads: Vec<String>,
    ) -> &mut Self {
        self.entrypoints.insert(
            specifier.into(),
            ManifestEntry {
                file: file.into(),
                loads,
            },
        );
        self
    }

    pub fn get(&self, specifier: &str) -> Option<&ManifestEntry> {
        self.entrypoints.get(specifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entrypoints.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every chunk file name mentioned in the manifest.
    pub fn files(&self) -> BTreeSet<&str> {
        self.entrypoints
            .values()
            .flat_map(|entry| std::iter::once(&entry.file).chain(&entry.loads))
            .map(String::as_str)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Reads a manifest written by an earlier link, `None` if there isn't one.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>, LinkError> {
        match fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LinkError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Removes the chunks listed in this manifest from `dir`, unless
    /// `current` still uses them.
    pub fn prune(&self, dir: &Utf8Path, current: &Manifest) -> usize {
        let keep = current.files();
        let mut removed = 0;

        for file in self.files().difference(&keep) {
            let path = dir.join(file);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(%path, "couldn't remove stale chunk: {err}"),
            }
        }

        debug!(removed, "pruned stale chunks");
        removed
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), LinkError> {
        fs::write(path, self.to_json()?).map_err(|source| LinkError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
