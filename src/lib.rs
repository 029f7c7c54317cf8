#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod compiler;
mod core;
mod error;
pub mod graph;
pub mod linker;
pub mod resolve;
#[cfg(feature = "live")]
mod watch;

use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tracing::warn;

pub use crate::compiler::{CompileReport, Compiler, Outcome, Transpiler, Transpilers};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::graph::{CancelToken, Graph, TaskId};
pub use crate::linker::{Bundle, Chunker, MANIFEST, Manifest, PerEntrypoint, SplitCommon};
pub use crate::resolve::Resolver;

use crate::core::as_overhead;

/// Source roots compiled when none are configured.
pub const DEFAULT_SOURCES: [&str; 2] = ["src", "node_modules"];

/// A project to compile and bundle.
///
/// Every path is relative to the project root, which is the only absolute
/// path involved. The process working directory is never changed.
///
/// ```rust,no_run
/// use kobako::{Project, SplitCommon, Transpiler};
///
/// let manifest = Project::new("/path/to/app")
///     .entrypoint("./src/index.js")
///     .transpiler("ts", Transpiler::command("esbuild", ["{src}", "--outfile={dst}"]))
///     .chunker(SplitCommon)
///     .build()?;
/// # Ok::<(), kobako::KobakoError>(())
/// ```
#[derive(Clone)]
pub struct Project {
    root: Utf8PathBuf,
    out_dir: Utf8PathBuf,
    bundle_dir: Utf8PathBuf,
    sources: Vec<Utf8PathBuf>,
    entrypoints: Vec<String>,
    transpilers: Transpilers,
    concurrency: usize,
    chunker: Arc<dyn Chunker>,
}

impl Project {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            out_dir: Utf8PathBuf::from("build"),
            bundle_dir: Utf8PathBuf::from("dist"),
            sources: DEFAULT_SOURCES.iter().map(Utf8PathBuf::from).collect(),
            entrypoints: Vec::new(),
            transpilers: Transpilers::default(),
            concurrency: compiler::DEFAULT_CONCURRENCY,
            chunker: Arc::new(PerEntrypoint),
        }
    }

    /// Directory receiving compiled files and their records.
    pub fn out_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.out_dir = path.into();
        self
    }

    /// Directory receiving the chunks and the manifest.
    pub fn bundle_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.bundle_dir = path.into();
        self
    }

    /// Replaces the source roots.
    pub fn sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an entrypoint, written like an import from the build root,
    /// e.g. `./src/index.js`.
    pub fn entrypoint(mut self, specifier: impl Into<String>) -> Self {
        self.entrypoints.push(specifier.into());
        self
    }

    pub fn entrypoints<I, S>(mut self, specifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoints.extend(specifiers.into_iter().map(Into::into));
        self
    }

    pub fn transpiler(mut self, ext: &str, transpiler: Transpiler) -> Self {
        self.transpilers.register(ext, transpiler);
        self
    }

    /// Transpiler for files with no registered extension, a plain copy by
    /// default.
    pub fn fallback(mut self, transpiler: Transpiler) -> Self {
        self.transpilers.fallback(transpiler);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn chunker(mut self, chunker: impl Chunker + 'static) -> Self {
        self.chunker = Arc::new(chunker);
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sources_list(&self) -> &[Utf8PathBuf] {
        &self.sources
    }

    /// Path of the compiled tree, which is the linker's build root.
    pub fn build_root(&self) -> Utf8PathBuf {
        self.root.join(&self.out_dir)
    }

    /// Path of the bundle directory.
    pub fn dist(&self) -> Utf8PathBuf {
        self.root.join(&self.bundle_dir)
    }

    pub fn compiler(&self) -> Compiler {
        Compiler::new(self.root.clone(), self.out_dir.clone())
            .with_transpilers(self.transpilers.clone())
            .with_concurrency(self.concurrency)
    }

    /// Compiles every changed file below the source roots.
    pub fn compile(&self, cancel: &CancelToken) -> Result<CompileReport, CompileError> {
        let s = Instant::now();
        let report = self.compiler().compile_tree(&self.sources, cancel)?;

        eprintln!(
            "Compiled {} files, {} up to date {}",
            report.compiled,
            report.cached,
            as_overhead(s)
        );

        Ok(report)
    }

    /// Bundles the entrypoints from the compiled tree.
    ///
    /// Chunks listed in the previous manifest which are no longer produced
    /// are removed from the bundle directory.
    pub fn link(&self) -> Result<Manifest, LinkError> {
        let s = Instant::now();
        let dist = self.dist();
        let previous = Manifest::load(&dist.join(MANIFEST)).unwrap_or_else(|err| {
            warn!("ignoring previous manifest: {err}");
            None
        });

        let mut bundle = Bundle::find(self.build_root(), &self.entrypoints[..])?;
        bundle.chunk(self.chunker.as_ref());
        let manifest = bundle.write(&dist)?;

        if let Some(previous) = previous {
            previous.prune(&dist, &manifest);
        }

        eprintln!(
            "Linked {} modules into {} chunks {}",
            bundle.files().len(),
            bundle.chunks().len(),
            as_overhead(s)
        );

        Ok(manifest)
    }

    /// Compiles, then links.
    pub fn build(&self) -> Result<Manifest, KobakoError> {
        eprintln!(
            "Running {} in {} mode.",
            style("kobako").red(),
            style("build").blue()
        );

        self.run(&CancelToken::new())
    }

    pub(crate) fn run(&self, cancel: &CancelToken) -> Result<Manifest, KobakoError> {
        self.compile(cancel)?;
        Ok(self.link()?)
    }

    /// Builds once, then rebuilds on every change below the source roots
    /// until `cancel` is triggered.
    #[cfg(feature = "live")]
    pub fn watch(&self, cancel: &CancelToken) -> Result<(), KobakoError> {
        eprintln!(
            "Running {} in {} mode.",
            style("kobako").red(),
            style("watch").blue()
        );

        watch::watch(self, cancel)?;
        Ok(())
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("root", &self.root)
            .field("out_dir", &self.out_dir)
            .field("bundle_dir", &self.bundle_dir)
            .field("sources", &self.sources)
            .field("entrypoints", &self.entrypoints)
            .field("transpilers", &self.transpilers)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Installs a `tracing` subscriber printing to stderr without breaking the
/// progress bars. The filter is read from `RUST_LOG`, `info` by default.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_paths() {
        let project = Project::new("/app").out_dir("out").bundle_dir("public/js");

        assert_eq!(project.build_root(), "/app/out");
        assert_eq!(project.dist(), "/app/public/js");
        assert_eq!(project.sources_list(), &["src", "node_modules"]);
    }
}
