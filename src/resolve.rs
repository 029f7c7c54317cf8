//! Node-style module resolution.
//!
//! Every path going in and out of the [`Resolver`] is relative to its root.
//! The same specifier may legitimately resolve to different files when asked
//! from different base directories.

use std::fs::{self, Metadata};
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::core::normalize_path;

/// Extensions probed, in order, when a candidate path doesn't exist as is.
pub const EXTENSIONS: [&str; 4] = ["js", "jsx", "tsx", "ts"];

const NODE_MODULES: &str = "node_modules";
const PACKAGE_JSON: &str = "package.json";
const DEFAULT_MAIN: &str = "index.js";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Couldn't resolve \"{specifier}\" from \"{base}\"")]
    NotFound { specifier: String, base: Utf8PathBuf },

    #[error("Couldn't read {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed package manifest {path}:\n{source}")]
    PackageJson {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct PackageJson {
    #[serde(default)]
    main: Option<String>,
}

/// Resolves import specifiers to files below a root directory.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: Utf8PathBuf,
}

impl Resolver {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resolves `specifier` as written in a file located in `base`.
    ///
    /// * `./x`, `../x` and `/x` are joined to `base`.
    /// * Anything else is a package, looked up in `node_modules` at the root.
    ///
    /// The candidate is tried as is, then with every extension from
    /// [`EXTENSIONS`] appended. A directory resolves to the `main` field of
    /// its `package.json`, or to `index.js` if there is none.
    pub fn resolve(
        &self,
        base: impl AsRef<Utf8Path>,
        specifier: &str,
    ) -> Result<Utf8PathBuf, ResolveError> {
        let base = base.as_ref();
        let candidate = if is_path(specifier) {
            base.join(specifier.trim_start_matches('/'))
        } else {
            Utf8Path::new(NODE_MODULES).join(specifier)
        };

        let candidate = normalize_path(&candidate);

        let Some((path, meta)) = self.probe(&candidate) else {
            return Err(ResolveError::NotFound {
                specifier: specifier.to_string(),
                base: base.to_path_buf(),
            });
        };

        if meta.is_dir() {
            self.main(&path)
        } else {
            Ok(path)
        }
    }

    fn probe(&self, candidate: &Utf8Path) -> Option<(Utf8PathBuf, Metadata)> {
        if let Ok(meta) = fs::metadata(self.root.join(candidate)) {
            return Some((candidate.to_path_buf(), meta));
        }

        EXTENSIONS.iter().find_map(|ext| {
            let path = Utf8PathBuf::from(format!("{candidate}.{ext}"));
            fs::metadata(self.root.join(&path))
                .ok()
                .map(|meta| (path, meta))
        })
    }

    fn main(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, ResolveError> {
        let manifest = dir.join(PACKAGE_JSON);

        let main = match fs::read(self.root.join(&manifest)) {
            Ok(data) => serde_json::from_slice::<PackageJson>(&data)
                .map_err(|source| ResolveError::PackageJson {
                    path: manifest.clone(),
                    source,
                })?
                .main
                .filter(|main| !main.is_empty()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ResolveError::Io {
                    path: manifest,
                    source,
                });
            }
        };

        Ok(normalize_path(&dir.join(main.as_deref().unwrap_or(DEFAULT_MAIN))))
    }
}

fn is_path(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}
