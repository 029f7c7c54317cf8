use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix appended to a compiled file's name to get its record's name.
pub const RECORD_SUFFIX: &str = ".meta.cbor";

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("Couldn't access object record {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed object record {path}:\n{source}")]
    Malformed {
        path: Utf8PathBuf,
        source: ciborium::de::Error<std::io::Error>,
    },

    #[error("Couldn't encode object record {path}:\n{source}")]
    Encode {
        path: Utf8PathBuf,
        source: ciborium::ser::Error<std::io::Error>,
    },

    #[error("Missing object record for {0}, was it compiled?")]
    Missing(Utf8PathBuf),
}

/// Metadata persisted next to every compiled file.
///
/// The record is what makes compilation incremental: a source whose hash
/// matches `hash` doesn't need compiling again. It is also the only thing
/// the linker reads to discover the module graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Root-relative path of the compiled file.
    pub filename: Utf8PathBuf,
    /// Hex blake3 digest of the source at the time it was compiled.
    pub hash: String,
    /// Resolved import targets, de-duplicated, in order of first occurrence.
    pub imports: Vec<Utf8PathBuf>,
}

impl ObjectRecord {
    /// Path of the record belonging to the compiled file `file`.
    pub fn path_for(file: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{file}{RECORD_SUFFIX}"))
    }

    /// Reads the record stored at `path`, `None` if there isn't one.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>, ObjectError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ObjectError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        ciborium::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|source| ObjectError::Malformed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Like [`ObjectRecord::load`], but a missing record is an error.
    pub fn require(path: &Utf8Path) -> Result<Self, ObjectError> {
        Self::load(path)?.ok_or_else(|| ObjectError::Missing(path.to_path_buf()))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), ObjectError> {
        let io = |source| ObjectError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        let mut writer = BufWriter::new(File::create(path).map_err(io)?);

        ciborium::into_writer(self, &mut writer).map_err(|source| ObjectError::Encode {
            path: path.to_path_buf(),
            source,
        })?;

        writer.flush().map_err(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_path() {
        assert_eq!(
            ObjectRecord::path_for(Utf8Path::new("build/src/index.js")),
            "build/src/index.js.meta.cbor"
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let path = root.join("build/src/a.js.meta.cbor");

        assert_eq!(ObjectRecord::load(&path).unwrap(), None);
        assert!(matches!(
            ObjectRecord::require(&path),
            Err(ObjectError::Missing(_))
        ));

        let record = ObjectRecord {
            filename: "build/src/a.js".into(),
            hash: "ab".repeat(32),
            imports: vec!["src/b.js".into(), "node_modules/react/index.js".into()],
        };

        record.save(&path).unwrap();
        assert_eq!(ObjectRecord::require(&path).unwrap(), record);
    }

    #[test]
    fn test_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let path = root.join("a.js.meta.cbor");

        fs::write(&path, b"\xff\x00 definitely not cbor").unwrap();

        assert!(matches!(
            ObjectRecord::load(&path),
            Err(ObjectError::Malformed { .. })
        ));
    }
}
