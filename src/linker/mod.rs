//! Bundling of compiled files.
//!
//! The linker never looks at source text. It starts from the entrypoints,
//! follows the import lists stored in object records, and groups the files
//! it finds into chunks. A [`Bundle`] goes through three steps:
//!
//! 1. [`Bundle::find`] discovers every file reachable from the entrypoints.
//! 2. [`Bundle::chunk`] assigns the files to chunks with a [`Chunker`].
//! 3. [`Bundle::write`] serializes the chunks and a [`Manifest`].

mod chunker;
mod manifest;
mod runtime;
mod write;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;
use tracing::debug;

use crate::compiler::{ObjectError, ObjectRecord};
use crate::core::Hash32;
use crate::resolve::{ResolveError, Resolver};

pub use chunker::{Chunker, PerEntrypoint, SplitCommon};
pub use manifest::{MANIFEST, Manifest, ManifestEntry};

/// Prefix of chunks which don't belong to a single entrypoint.
pub const COMMON_PREFIX: &str = "common";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{importer} imports {import}, which was never compiled")]
    MissingImport {
        import: Utf8PathBuf,
        importer: Utf8PathBuf,
    },

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("Couldn't access {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't serialize bundle data:\n{0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    /// The specifier as it was configured.
    pub specifier: String,
    /// The module it resolved to, relative to the build root.
    pub module: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub record: ObjectRecord,
    /// Specifiers of every entrypoint that reaches this file.
    pub entrypoints: BTreeSet<String>,
}

/// Every discovered file, keyed by its path relative to the build root.
pub type Files = BTreeMap<Utf8PathBuf, FileEntry>;

/// An independently loadable output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// `None` for a chunk of shared modules.
    pub entrypoint: Option<Entrypoint>,
    /// Member files and their content hashes.
    pub files: BTreeMap<Utf8PathBuf, String>,
    /// File names of the chunks to load before starting the entrypoint.
    pub loads: Vec<String>,
}

impl Chunk {
    /// Hash of every `(path, content hash)` pair in path order, followed by
    /// the started module and the names of the chunks loaded first. Two
    /// chunks share a name only if they would be written identically.
    pub fn hash(&self) -> Hash32 {
        let members = self
            .files
            .iter()
            .flat_map(|(path, hash)| [path.as_str(), "\0", hash.as_str(), "\n"]);
        let start = self
            .entrypoint
            .iter()
            .flat_map(|entry| ["start\0", entry.module.as_str(), "\n"]);
        let loads = self
            .loads
            .iter()
            .flat_map(|name| ["load\0", name.as_str(), "\n"]);

        Hash32::hash_all(members.chain(start).chain(loads))
    }

    pub fn prefix(&self) -> &str {
        self.entrypoint
            .as_ref()
            .and_then(|entry| entry.module.file_stem())
            .unwrap_or(COMMON_PREFIX)
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}.js", self.prefix(), self.hash())
    }
}

#[derive(Debug)]
pub struct Bundle {
    root: Utf8PathBuf,
    entrypoints: Vec<Entrypoint>,
    files: Files,
    chunks: Vec<Chunk>,
}

impl Bundle {
    /// Discovers every file reachable from `entrypoints` inside the build
    /// root, which is the compiler's output directory.
    ///
    /// Entrypoints are resolved from the root. Unlike import rewriting during
    /// compilation, any file that can't be found here fails the whole link.
    pub fn find<S>(root: impl Into<Utf8PathBuf>, entrypoints: &[S]) -> Result<Self, LinkError>
    where
        S: AsRef<str>,
    {
        let mut finder = Finder::new(root.into());
        let mut starts = Vec::new();
        let mut seen = HashSet::new();

        for specifier in entrypoints {
            let specifier = specifier.as_ref();
            if !seen.insert(specifier) {
                continue;
            }

            let module = finder.resolver.resolve("", specifier)?;
            let index = finder.add(&module)?;

            starts.push((
                Entrypoint {
                    specifier: specifier.to_string(),
                    module,
                },
                index,
            ));
        }

        finder.traverse()?;

        let Finder {
            resolver,
            graph,
            records,
            ..
        } = finder;

        let mut files: Files = records
            .into_iter()
            .map(|(path, record)| {
                let entry = FileEntry {
                    record,
                    entrypoints: BTreeSet::new(),
                };
                (path, entry)
            })
            .collect();

        for (entrypoint, start) in &starts {
            let mut dfs = Dfs::new(&graph, *start);
            while let Some(node) = dfs.next(&graph) {
                if let Some(file) = files.get_mut(&graph[node]) {
                    file.entrypoints.insert(entrypoint.specifier.clone());
                }
            }
        }

        debug!(files = files.len(), entrypoints = starts.len(), "found bundle files");

        Ok(Self {
            root: resolver.root().to_path_buf(),
            entrypoints: starts.into_iter().map(|(entry, _)| entry).collect(),
            files,
            chunks: Vec::new(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entrypoints(&self) -> &[Entrypoint] {
        &self.entrypoints
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Replaces the chunks with the ones produced by `chunker`.
    pub fn chunk(&mut self, chunker: &dyn Chunker) -> &mut Self {
        self.chunks = chunker.chunk(&self.entrypoints, &self.files);
        self
    }
}

/// Transitive record loading state for [`Bundle::find`].
struct Finder {
    resolver: Resolver,
    graph: DiGraph<Utf8PathBuf, ()>,
    nodes: HashMap<Utf8PathBuf, NodeIndex>,
    records: BTreeMap<Utf8PathBuf, ObjectRecord>,
    queue: Vec<NodeIndex>,
}

impl Finder {
    fn new(root: Utf8PathBuf) -> Self {
        Self {
            resolver: Resolver::new(root),
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            records: BTreeMap::new(),
            queue: Vec::new(),
        }
    }

    /// Loads the record of `path` once, every later call is a lookup.
    fn add(&mut self, path: &Utf8Path) -> Result<NodeIndex, LinkError> {
        if let Some(&index) = self.nodes.get(path) {
            return Ok(index);
        }

        let record_path = self.resolver.root().join(ObjectRecord::path_for(path));
        let record = ObjectRecord::require(&record_path)?;

        let index = self.graph.add_node(path.to_path_buf());
        self.nodes.insert(path.to_path_buf(), index);
        self.records.insert(path.to_path_buf(), record);
        self.queue.push(index);

        Ok(index)
    }

    fn traverse(&mut self) -> Result<(), LinkError> {
        while let Some(index) = self.queue.pop() {
            let importer = self.graph[index].clone();
            let imports = self.records[&importer].imports.clone();

            for import in imports {
                if !self.resolver.root().join(&import).is_file() {
                    return Err(LinkError::MissingImport { import, importer });
                }

                let target = self.add(&import)?;
                self.graph.update_edge(index, target, ());
            }
        }

        Ok(())
    }
}
