use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;

const PLACEHOLDER_SRC: &str = "{src}";
const PLACEHOLDER_DST: &str = "{dst}";

#[derive(Debug, Error)]
pub enum TranspileError {
    #[error("Couldn't copy {src} to {dst}:\n{source}")]
    Copy {
        src: String,
        dst: String,
        source: std::io::Error,
    },

    #[error("Couldn't run `{program}`:\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("`{program}` failed on {src} ({status})")]
    Status {
        program: String,
        src: String,
        status: ExitStatus,
    },

    #[error("Transpiling {src} failed:\n{source}")]
    Custom { src: String, source: anyhow::Error },
}

type CustomFn = dyn Fn(&Utf8Path, &Utf8Path) -> anyhow::Result<()> + Send + Sync;

/// Turns one source file into one compiled file.
#[derive(Clone)]
pub enum Transpiler {
    /// Copies the source verbatim.
    Copy,
    /// Runs an external program. Every `{src}` and `{dst}` in `args` is
    /// replaced with the absolute source and destination paths.
    Command { program: String, args: Vec<String> },
    /// Runs a function in process, with absolute source and destination.
    Custom(Arc<CustomFn>),
}

impl Transpiler {
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Transpiler::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Utf8Path, &Utf8Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Transpiler::Custom(Arc::new(f))
    }

    /// Produces `dst` from `src`. Both paths are absolute, `cwd` is the
    /// project root external programs run in.
    pub fn run(&self, cwd: &Utf8Path, src: &Utf8Path, dst: &Utf8Path) -> Result<(), TranspileError> {
        match self {
            Transpiler::Copy => {
                fs::copy(src, dst).map_err(|source| TranspileError::Copy {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    source,
                })?;
            }
            Transpiler::Command { program, args } => {
                let args = args.iter().map(|arg| {
                    arg.replace(PLACEHOLDER_SRC, src.as_str())
                        .replace(PLACEHOLDER_DST, dst.as_str())
                });

                let status = Command::new(program)
                    .args(args)
                    .current_dir(cwd)
                    .stdin(Stdio::null())
                    .stderr(Stdio::inherit())
                    .status()
                    .map_err(|source| TranspileError::Spawn {
                        program: program.clone(),
                        source,
                    })?;

                if !status.success() {
                    return Err(TranspileError::Status {
                        program: program.clone(),
                        src: src.to_string(),
                        status,
                    });
                }
            }
            Transpiler::Custom(f) => {
                f(src, dst).map_err(|source| TranspileError::Custom {
                    src: src.to_string(),
                    source,
                })?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Transpiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transpiler::Copy => f.write_str("Copy"),
            Transpiler::Command { program, args } => f
                .debug_struct("Command")
                .field("program", program)
                .field("args", args)
                .finish(),
            Transpiler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Extension keyed table of transpilers with an explicit fallback.
#[derive(Debug, Clone)]
pub struct Transpilers {
    table: HashMap<String, Transpiler>,
    fallback: Transpiler,
}

impl Default for Transpilers {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
            fallback: Transpiler::Copy,
        }
    }
}

impl Transpilers {
    /// Registers `transpiler` for `ext`, given with or without the leading
    /// dot, in any case.
    pub fn register(&mut self, ext: &str, transpiler: Transpiler) -> &mut Self {
        self.table.insert(normalize_ext(ext), transpiler);
        self
    }

    /// Sets the transpiler used for unregistered extensions.
    pub fn fallback(&mut self, transpiler: Transpiler) -> &mut Self {
        self.fallback = transpiler;
        self
    }

    /// The transpiler for `path`, picked by its extension.
    pub fn get(&self, path: &Utf8Path) -> &Transpiler {
        path.extension()
            .and_then(|ext| self.table.get(&normalize_ext(ext)))
            .unwrap_or(&self.fallback)
    }
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut transpilers = Transpilers::default();
        transpilers.register(".TS", Transpiler::command("esbuild", ["{src}"]));

        assert!(matches!(
            transpilers.get(Utf8Path::new("src/a.ts")),
            Transpiler::Command { .. }
        ));
        assert!(matches!(
            transpilers.get(Utf8Path::new("src/a.Ts")),
            Transpiler::Command { .. }
        ));
        assert!(matches!(
            transpilers.get(Utf8Path::new("src/a.js")),
            Transpiler::Copy
        ));
        assert!(matches!(
            transpilers.get(Utf8Path::new("src/Makefile")),
            Transpiler::Copy
        ));
    }

    #[test]
    fn test_fallback() {
        let mut transpilers = Transpilers::default();
        transpilers.fallback(Transpiler::custom(|_, _| Ok(())));

        assert!(matches!(
            transpilers.get(Utf8Path::new("a.css")),
            Transpiler::Custom(_)
        ));
    }

    #[test]
    fn test_copy_and_custom() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("a.js");
        let dst = root.join("b.js");
        fs::write(&src, "hello").unwrap();

        Transpiler::Copy.run(&root, &src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");

        let upper = Transpiler::custom(|src, dst| {
            let data = fs::read_to_string(src)?;
            fs::write(dst, data.to_uppercase())?;
            Ok(())
        });
        upper.run(&root, &src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "HELLO");

        let failing = Transpiler::custom(|_, _| anyhow::bail!("nope"));
        assert!(matches!(
            failing.run(&root, &src, &dst),
            Err(TranspileError::Custom { .. })
        ));
    }

    #[test]
    fn test_command_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let transpiler = Transpiler::command("kobako-no-such-program", ["{src}", "{dst}"]);

        assert!(matches!(
            transpiler.run(&root, &root.join("a"), &root.join("b")),
            Err(TranspileError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_substitutes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("a.js");
        let dst = root.join("out/a.js");
        fs::write(&src, "hello").unwrap();
        fs::create_dir_all(root.join("out")).unwrap();

        Transpiler::command("cp", ["{src}", "{dst}"])
            .run(&root, &src, &dst)
            .unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_runs_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("a.js");
        fs::write(&src, "hello").unwrap();

        // A relative output path lands in the project root.
        Transpiler::command("sh", ["-c", "cp \"$0\" relative.js", "{src}"])
            .run(&root, &src, &root.join("unused.js"))
            .unwrap();
        assert_eq!(fs::read_to_string(root.join("relative.js")).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        match Transpiler::command("sh", ["-c", "exit 3"]).run(&root, &root.join("a"), &root.join("b")) {
            Err(TranspileError::Status { program, status, .. }) => {
                assert_eq!(program, "sh");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected a failed status, got {other:?}"),
        }
    }
}
