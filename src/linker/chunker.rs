use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::linker::{Chunk, Entrypoint, FileEntry, Files};

/// A strategy for distributing the files of a bundle into chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, entrypoints: &[Entrypoint], files: &Files) -> Vec<Chunk>;
}

/// One chunk per entrypoint, holding every file the entrypoint reaches.
/// Files shared by several entrypoints are duplicated into each chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerEntrypoint;

impl Chunker for PerEntrypoint {
    fn chunk(&self, entrypoints: &[Entrypoint], files: &Files) -> Vec<Chunk> {
        entrypoints
            .iter()
            .map(|entry| Chunk {
                entrypoint: Some(entry.clone()),
                files: members(files, |file| file.entrypoints.contains(&entry.specifier)),
                loads: Vec::new(),
            })
            .collect()
    }
}

/// Files reached by more than one entrypoint go into a single `common`
/// chunk, which every entrypoint needing it loads first.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitCommon;

impl Chunker for SplitCommon {
    fn chunk(&self, entrypoints: &[Entrypoint], files: &Files) -> Vec<Chunk> {
        let shared = members(files, |file| file.entrypoints.len() > 1);

        if shared.is_empty() {
            return PerEntrypoint.chunk(entrypoints, files);
        }

        let common = Chunk {
            entrypoint: None,
            files: shared,
            loads: Vec::new(),
        };
        let common_name = common.file_name();

        let mut chunks: Vec<Chunk> = entrypoints
            .iter()
            .map(|entry| {
                let reaches = |file: &FileEntry| file.entrypoints.contains(&entry.specifier);

                let loads = if files.values().any(|file| reaches(file) && file.entrypoints.len() > 1) {
                    vec![common_name.clone()]
                } else {
                    Vec::new()
                };

                Chunk {
                    entrypoint: Some(entry.clone()),
                    files: members(files, |file| reaches(file) && file.entrypoints.len() == 1),
                    loads,
                }
            })
            .collect();

        chunks.push(common);
        chunks
    }
}

fn members<F>(files: &Files, filter: F) -> BTreeMap<Utf8PathBuf, String>
where
    F: Fn(&FileEntry) -> bool,
{
    files
        .iter()
        .filter(|(_, file)| filter(file))
        .map(|(path, file)| (path.clone(), file.record.hash.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use camino::Utf8Path;

    use super::*;
    use crate::compiler::ObjectRecord;

    fn entry(specifier: &str, module: &str) -> Entrypoint {
        Entrypoint {
            specifier: specifier.into(),
            module: module.into(),
        }
    }

    fn files(list: &[(&str, &[&str])]) -> Files {
        list.iter()
            .map(|(path, entrypoints)| {
                let record = ObjectRecord {
                    filename: Utf8Path::new("build").join(path),
                    hash: format!("hash-of-{path}"),
                    imports: vec![],
                };
                let entry = FileEntry {
                    record,
                    entrypoints: entrypoints.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                };
                (Utf8PathBuf::from(path), entry)
            })
            .collect()
    }

    fn paths(chunk: &Chunk) -> Vec<&str> {
        chunk.files.keys().map(|path| path.as_str()).collect()
    }

    #[test]
    fn test_per_entrypoint_duplicates_shared() {
        let entrypoints = [entry("./a", "a.js"), entry("./b", "b.js")];
        let files = files(&[
            ("a.js", &["./a"]),
            ("b.js", &["./b"]),
            ("shared.js", &["./a", "./b"]),
        ]);

        let chunks = PerEntrypoint.chunk(&entrypoints, &files);

        assert_eq!(chunks.len(), 2);
        assert_eq!(paths(&chunks[0]), vec!["a.js", "shared.js"]);
        assert_eq!(paths(&chunks[1]), vec!["b.js", "shared.js"]);
        assert!(chunks.iter().all(|chunk| chunk.loads.is_empty()));
        assert_eq!(chunks[0].files[Utf8Path::new("shared.js")], "hash-of-shared.js");
    }

    #[test]
    fn test_split_common() {
        let entrypoints = [entry("./a", "a.js"), entry("./b", "b.js"), entry("./c", "c.js")];
        let files = files(&[
            ("a.js", &["./a"]),
            ("b.js", &["./b"]),
            ("c.js", &["./c"]),
            ("shared.js", &["./a", "./b"]),
            ("util.js", &["./a", "./b"]),
        ]);

        let chunks = SplitCommon.chunk(&entrypoints, &files);
        assert_eq!(chunks.len(), 4);

        let common = &chunks[3];
        assert!(common.entrypoint.is_none());
        assert_eq!(paths(common), vec!["shared.js", "util.js"]);
        assert!(common.file_name().starts_with("common."));

        assert_eq!(paths(&chunks[0]), vec!["a.js"]);
        assert_eq!(chunks[0].loads, vec![common.file_name()]);
        assert_eq!(paths(&chunks[1]), vec!["b.js"]);
        assert_eq!(chunks[1].loads, vec![common.file_name()]);

        // `c` shares nothing, so it has nothing to wait for.
        assert_eq!(paths(&chunks[2]), vec!["c.js"]);
        assert!(chunks[2].loads.is_empty());
    }

    #[test]
    fn test_split_without_shared_files() {
        let entrypoints = [entry("./a", "a.js"), entry("./b", "b.js")];
        let files = files(&[("a.js", &["./a"]), ("b.js", &["./b"])]);

        assert_eq!(
            SplitCommon.chunk(&entrypoints, &files),
            PerEntrypoint.chunk(&entrypoints, &files)
        );
    }
}
