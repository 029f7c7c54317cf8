//! Incremental compilation of source trees.
//!
//! Every source file `<source root>/<path>` is compiled to
//! `<out dir>/<source root>/<path>`, and an [`ObjectRecord`] is stored next to
//! the result. A file is only compiled again when its content hash no longer
//! matches the one in its record. Script files additionally get their
//! `require` specifiers rewritten to root-relative paths, which is what the
//! linker later uses to find the module graph.

pub mod object;
pub mod scanner;
pub mod transpile;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{Level, debug, error, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Hash32, progress_style};
use crate::graph::{CancelToken, Graph, SolveError};
use crate::resolve::{EXTENSIONS, Resolver};

pub use object::{ObjectError, ObjectRecord};
pub use transpile::{TranspileError, Transpiler, Transpilers};

/// Number of files compiled at the same time unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Couldn't access {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Transpile(#[from] TranspileError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("Invalid source pattern:\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't walk the source tree:\n{0}")]
    Walk(#[from] glob::GlobError),

    #[error("Source path is not valid UTF-8: {0:?}")]
    NonUtf8(PathBuf),

    #[error("Compilation was aborted:\n{0}")]
    Aborted(#[source] SolveError),
}

/// What happened to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record was up to date, nothing was touched.
    Cached,
    /// The file was compiled, these are its resolved imports.
    Compiled { imports: Vec<Utf8PathBuf> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub compiled: usize,
    pub cached: usize,
}

#[derive(Debug, Clone)]
pub struct Compiler {
    root: Utf8PathBuf,
    out_dir: Utf8PathBuf,
    transpilers: Transpilers,
    resolver: Resolver,
    concurrency: usize,
}

impl Compiler {
    /// A compiler for the project at `root`, writing into `out_dir`, which is
    /// relative to `root`.
    pub fn new(root: impl Into<Utf8PathBuf>, out_dir: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();

        Self {
            resolver: Resolver::new(root.clone()),
            root,
            out_dir: out_dir.into(),
            transpilers: Transpilers::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_transpilers(mut self, transpilers: Transpilers) -> Self {
        self.transpilers = transpilers;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Root-relative path of the compiled counterpart of a source file.
    pub fn destination(&self, source_root: &Utf8Path, relative: &Utf8Path) -> Utf8PathBuf {
        self.out_dir.join(source_root).join(relative)
    }

    /// Compiles `source_root/relative` unless its record is up to date.
    pub fn compile_file(
        &self,
        source_root: &Utf8Path,
        relative: &Utf8Path,
    ) -> Result<Outcome, CompileError> {
        let src = source_root.join(relative);
        let dst = self.destination(source_root, relative);
        let src_abs = self.root.join(&src);
        let dst_abs = self.root.join(&dst);
        let record_path = self.root.join(ObjectRecord::path_for(&dst));

        let hash = Hash32::hash_file(&src_abs)
            .map_err(|source| CompileError::Io {
                path: src.clone(),
                source,
            })?
            .to_hex();

        let previous = ObjectRecord::load(&record_path).unwrap_or_else(|err| {
            warn!("{err}, recompiling");
            None
        });

        if let Some(previous) = previous
            && previous.hash == hash
            && dst_abs.exists()
        {
            debug!(file = %src, "up to date");
            return Ok(Outcome::Cached);
        }

        if let Some(parent) = dst_abs.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CompileError::Io {
                path: dst.clone(),
                source,
            })?;
        }

        self.transpilers
            .get(&src)
            .run(&self.root, &src_abs, &dst_abs)?;

        let imports = if is_script(&src) {
            let base = src.parent().unwrap_or(Utf8Path::new(""));
            scanner::rewrite_file(&dst_abs, base, &self.resolver).map_err(|source| {
                CompileError::Io {
                    path: dst.clone(),
                    source,
                }
            })?
        } else {
            Vec::new()
        };

        let record = ObjectRecord {
            filename: dst,
            hash,
            imports,
        };

        record.save(&record_path)?;
        debug!(file = %src, imports = record.imports.len(), "compiled");

        Ok(Outcome::Compiled {
            imports: record.imports,
        })
    }

    /// Compiles every file below each of `sources` in parallel.
    ///
    /// A failing file doesn't stop the others. Once everything finished, the
    /// first failure is returned.
    pub fn compile_tree(
        &self,
        sources: &[Utf8PathBuf],
        cancel: &CancelToken,
    ) -> Result<CompileReport, CompileError> {
        let files = self.discover(sources)?;

        let mut graph = Graph::new(self.concurrency);
        for id in 0..files.len() {
            graph.task(id, []);
        }
        debug!(tasks = graph.len(), concurrency = self.concurrency, "compiling tree");

        let span = tracing::span!(Level::INFO, "compile");
        span.pb_set_length(files.len() as u64);
        span.pb_set_style(&progress_style());
        span.pb_set_message("Compiling...");
        let _enter = span.enter();

        let errors = Mutex::new(Vec::new());
        let compiled = AtomicUsize::new(0);
        let cached = AtomicUsize::new(0);

        graph
            .solve(cancel, |token, id| {
                if token.is_cancelled() {
                    return Ok(());
                }

                let (source_root, relative) = &files[id];

                match self.compile_file(source_root, relative) {
                    Ok(Outcome::Cached) => {
                        cached.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Outcome::Compiled { .. }) => {
                        compiled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        error!("{err}");
                        errors
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(err);
                    }
                }

                span.pb_inc(1);
                Ok(())
            })
            .map_err(CompileError::Aborted)?;

        if let Some(err) = errors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .next() {
            return Err(err);
        }

        Ok(CompileReport {
            compiled: compiled.into_inner(),
            cached: cached.into_inner(),
        })
    }

    /// Lists every regular file below the source roots as
    /// `(source root, path relative to it)`.
    fn discover(
        &self,
        sources: &[Utf8PathBuf],
    ) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf)>, CompileError> {
        let mut files = Vec::new();

        for source in sources {
            let dir = self.root.join(source);

            if !dir.is_dir() {
                warn!(%source, "source root doesn't exist, skipping");
                continue;
            }

            let pattern = format!("{}/**/*", glob::Pattern::escape(dir.as_str()));

            for entry in glob::glob(&pattern)? {
                let path = Utf8PathBuf::try_from(entry?)
                    .map_err(|err| CompileError::NonUtf8(err.into_path_buf()))?;

                if !path.is_file() {
                    continue;
                }

                if let Ok(relative) = path.strip_prefix(&dir) {
                    files.push((source.clone(), relative.to_path_buf()));
                }
            }
        }

        Ok(files)
    }
}

/// Only these files go through the import scanner.
fn is_script(path: &Utf8Path) -> bool {
    path.extension()
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;

    fn setup(files: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        for (path, data) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }

        (dir, root)
    }

    fn counting(calls: Arc<AtomicUsize>) -> Transpilers {
        let mut transpilers = Transpilers::default();
        transpilers.fallback(Transpiler::custom(move |src, dst| {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::copy(src, dst)?;
            Ok(())
        }));
        transpilers
    }

    #[test]
    fn test_cache_idempotence() {
        let (_dir, root) = setup(&[
            ("src/index.js", "var b = require('./b');"),
            ("src/b.js", "module.exports = 1;"),
        ]);

        let calls = Arc::new(AtomicUsize::new(0));
        let compiler = Compiler::new(&root, "build").with_transpilers(counting(calls.clone()));
        let src = Utf8Path::new("src");
        let file = Utf8Path::new("index.js");

        let first = compiler.compile_file(src, file).unwrap();
        assert_eq!(
            first,
            Outcome::Compiled {
                imports: vec!["src/b.js".into()]
            }
        );
        let output = fs::read(root.join("build/src/index.js")).unwrap();
        let record = fs::read(root.join("build/src/index.js.meta.cbor")).unwrap();

        assert_eq!(compiler.compile_file(src, file).unwrap(), Outcome::Cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(root.join("build/src/index.js")).unwrap(), output);
        assert_eq!(fs::read(root.join("build/src/index.js.meta.cbor")).unwrap(), record);
    }

    #[test]
    fn test_changed_source_recompiles() {
        let (_dir, root) = setup(&[("src/a.js", "1")]);

        let calls = Arc::new(AtomicUsize::new(0));
        let compiler = Compiler::new(&root, "build").with_transpilers(counting(calls.clone()));
        let src = Utf8Path::new("src");
        let file = Utf8Path::new("a.js");

        compiler.compile_file(src, file).unwrap();
        fs::write(root.join("src/a.js"), "2").unwrap();

        assert!(matches!(
            compiler.compile_file(src, file).unwrap(),
            Outcome::Compiled { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_to_string(root.join("build/src/a.js")).unwrap(), "2");
    }

    #[test]
    fn test_missing_output_recompiles() {
        let (_dir, root) = setup(&[("src/a.js", "1")]);

        let compiler = Compiler::new(&root, "build");
        let src = Utf8Path::new("src");
        let file = Utf8Path::new("a.js");

        compiler.compile_file(src, file).unwrap();
        fs::remove_file(root.join("build/src/a.js")).unwrap();

        assert!(matches!(
            compiler.compile_file(src, file).unwrap(),
            Outcome::Compiled { .. }
        ));
        assert!(root.join("build/src/a.js").exists());
    }

    #[test]
    fn test_malformed_record_recompiles() {
        let (_dir, root) = setup(&[
            ("src/a.js", "1"),
            ("build/src/a.js", "stale"),
            ("build/src/a.js.meta.cbor", "garbage"),
        ]);

        let compiler = Compiler::new(&root, "build");

        assert!(matches!(
            compiler
                .compile_file(Utf8Path::new("src"), Utf8Path::new("a.js"))
                .unwrap(),
            Outcome::Compiled { .. }
        ));
        assert_eq!(fs::read_to_string(root.join("build/src/a.js")).unwrap(), "1");
    }

    #[test]
    fn test_rewrite_and_record() {
        let (_dir, root) = setup(&[
            (
                "src/app/index.js",
                "var React = require('react');\nvar util = require('../util');\nrequire('./gone');",
            ),
            ("src/util.ts", ""),
            ("node_modules/react/index.js", ""),
        ]);

        let compiler = Compiler::new(&root, "build");
        let outcome = compiler
            .compile_file(Utf8Path::new("src"), Utf8Path::new("app/index.js"))
            .unwrap();

        let imports: Vec<Utf8PathBuf> = vec!["node_modules/react/index.js".into(), "src/util.ts".into()];
        assert_eq!(
            outcome,
            Outcome::Compiled {
                imports: imports.clone()
            }
        );

        assert_eq!(
            fs::read_to_string(root.join("build/src/app/index.js")).unwrap(),
            "var React = require('node_modules/react/index.js');\n\
             var util = require('src/util.ts');\n\
             require('./gone');"
        );

        let record = ObjectRecord::require(&root.join("build/src/app/index.js.meta.cbor")).unwrap();
        assert_eq!(record.filename, "build/src/app/index.js");
        assert_eq!(record.imports, imports);
        assert_eq!(
            record.hash,
            Hash32::hash_file(root.join("src/app/index.js")).unwrap().to_hex()
        );
    }

    #[test]
    fn test_non_scripts_are_copied_verbatim() {
        let source = "a::after { content: \"require('x')\" }";
        let (_dir, root) = setup(&[("src/a.css", source), ("src/x.js", "")]);

        let compiler = Compiler::new(&root, "build");
        let outcome = compiler
            .compile_file(Utf8Path::new("src"), Utf8Path::new("a.css"))
            .unwrap();

        assert_eq!(outcome, Outcome::Compiled { imports: vec![] });
        assert_eq!(fs::read_to_string(root.join("build/src/a.css")).unwrap(), source);
        assert!(root.join("build/src/a.css.meta.cbor").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_transpiler() {
        let (_dir, root) = setup(&[("src/a.js", "require('./b');"), ("src/b.js", "")]);

        let mut transpilers = Transpilers::default();
        transpilers.register("js", Transpiler::command("cp", ["{src}", "{dst}"]));
        let compiler = Compiler::new(&root, "build").with_transpilers(transpilers);

        let outcome = compiler
            .compile_file(Utf8Path::new("src"), Utf8Path::new("a.js"))
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Compiled {
                imports: vec!["src/b.js".into()]
            }
        );
        assert_eq!(
            fs::read_to_string(root.join("build/src/a.js")).unwrap(),
            "require('src/b.js');"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_leaves_no_record() {
        let (_dir, root) = setup(&[("src/a.js", "")]);

        let mut transpilers = Transpilers::default();
        transpilers.register("js", Transpiler::command("sh", ["-c", "exit 1"]));
        let compiler = Compiler::new(&root, "build").with_transpilers(transpilers);

        assert!(matches!(
            compiler.compile_file(Utf8Path::new("src"), Utf8Path::new("a.js")),
            Err(CompileError::Transpile(TranspileError::Status { .. }))
        ));
        assert!(!root.join("build/src/a.js.meta.cbor").exists());
    }

    #[test]
    fn test_compile_tree() {
        let (_dir, root) = setup(&[
            ("src/index.js", "require('./lib/a')"),
            ("src/lib/a.js", "require('react')"),
            ("src/style.css", ""),
            ("node_modules/react/index.js", ""),
        ]);

        let sources: Vec<Utf8PathBuf> = vec!["src".into(), "node_modules".into(), "missing".into()];
        let compiler = Compiler::new(&root, "build").with_concurrency(2);

        let report = compiler.compile_tree(&sources, &CancelToken::new()).unwrap();
        assert_eq!(report, CompileReport { compiled: 4, cached: 0 });

        assert!(root.join("build/src/lib/a.js").exists());
        assert!(root.join("build/node_modules/react/index.js").exists());

        let report = compiler.compile_tree(&sources, &CancelToken::new()).unwrap();
        assert_eq!(report, CompileReport { compiled: 0, cached: 4 });
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let (_dir, root) = setup(&[
            ("src/a.js", ""),
            ("src/bad.js", ""),
            ("src/c.js", ""),
            ("src/d.js", ""),
        ]);

        let mut transpilers = Transpilers::default();
        transpilers.fallback(Transpiler::custom(|src, dst| {
            if src.file_name() == Some("bad.js") {
                anyhow::bail!("syntax error");
            }
            fs::copy(src, dst)?;
            Ok(())
        }));

        let compiler = Compiler::new(&root, "build")
            .with_transpilers(transpilers)
            .with_concurrency(1);

        let result = compiler.compile_tree(&["src".into()], &CancelToken::new());
        assert!(matches!(
            result,
            Err(CompileError::Transpile(TranspileError::Custom { .. }))
        ));

        assert!(root.join("build/src/a.js").exists());
        assert!(root.join("build/src/c.js").exists());
        assert!(root.join("build/src/d.js").exists());
        assert!(!root.join("build/src/bad.js.meta.cbor").exists());
    }

    #[test]
    fn test_cancelled_tree() {
        let (_dir, root) = setup(&[("src/a.js", "")]);

        let cancel = CancelToken::new();
        cancel.cancel();

        let result = Compiler::new(&root, "build").compile_tree(&["src".into()], &cancel);
        assert!(matches!(
            result,
            Err(CompileError::Aborted(SolveError::Cancelled))
        ));
    }
}
