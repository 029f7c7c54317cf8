use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use kobako::{CancelToken, PerEntrypoint, Project, SplitCommon, Transpiler};
use serde::Deserialize;

const PROJECT_FILE: &str = "kobako.json";

/// Key of the transpiler used for extensions without their own entry.
const FALLBACK_KEY: &str = "*";

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    Build,
    Watch,
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum Chunking {
    PerEntrypoint,
    SplitCommon,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Incremental JavaScript compiler and bundler")]
struct Args {
    #[clap(value_enum, index = 1, default_value = "build")]
    mode: Mode,

    /// Project root, every other path is relative to it.
    #[clap(long, default_value = ".")]
    root: Utf8PathBuf,

    /// Project file, `kobako.json` in the root when present.
    #[clap(long)]
    config: Option<Utf8PathBuf>,

    /// Output directory for compiled files.
    #[clap(long)]
    out: Option<Utf8PathBuf>,

    /// Output directory for bundles.
    #[clap(long)]
    dist: Option<Utf8PathBuf>,

    /// Source root, may be repeated.
    #[clap(long = "src")]
    sources: Vec<Utf8PathBuf>,

    /// Entrypoint, e.g. `./src/index.js`, may be repeated.
    #[clap(long = "entry")]
    entrypoints: Vec<String>,

    /// Number of files compiled in parallel.
    #[clap(long, short)]
    jobs: Option<usize>,

    #[clap(long, value_enum)]
    chunks: Option<Chunking>,
}

/// Contents of `kobako.json`. Flags given on the command line win.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct ProjectFile {
    out: Option<Utf8PathBuf>,
    dist: Option<Utf8PathBuf>,
    sources: Option<Vec<Utf8PathBuf>>,
    entrypoints: Vec<String>,
    concurrency: Option<usize>,
    chunking: Option<Chunking>,
    /// Extension to command line, `{src}` and `{dst}` are substituted.
    transpilers: BTreeMap<String, Vec<String>>,
}

impl ProjectFile {
    fn load(path: &Utf8Path, required: bool) -> anyhow::Result<Self> {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Malformed project file {path}")),
            Err(err) if err.kind() == ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("Couldn't read project file {path}")),
        }
    }
}

fn configure(root: Utf8PathBuf, file: ProjectFile, args: &Args) -> anyhow::Result<Project> {
    let mut project = Project::new(root);

    if let Some(out) = args.out.clone().or(file.out) {
        project = project.out_dir(out);
    }
    if let Some(dist) = args.dist.clone().or(file.dist) {
        project = project.bundle_dir(dist);
    }

    if !args.sources.is_empty() {
        project = project.sources(args.sources.clone());
    } else if let Some(sources) = file.sources {
        project = project.sources(sources);
    }

    let entrypoints = if args.entrypoints.is_empty() {
        file.entrypoints
    } else {
        args.entrypoints.clone()
    };
    if entrypoints.is_empty() {
        bail!("No entrypoints, pass --entry or list them in {PROJECT_FILE}");
    }
    project = project.entrypoints(entrypoints);

    if let Some(jobs) = args.jobs.or(file.concurrency) {
        project = project.concurrency(jobs);
    }

    for (ext, command) in file.transpilers {
        let transpiler = match command.split_first() {
            Some((program, args)) => Transpiler::command(program, args.iter().cloned()),
            None => Transpiler::Copy,
        };

        project = match ext.as_str() {
            FALLBACK_KEY => project.fallback(transpiler),
            ext => project.transpiler(ext, transpiler),
        };
    }

    project = match args.chunks.or(file.chunking).unwrap_or(Chunking::PerEntrypoint) {
        Chunking::PerEntrypoint => project.chunker(PerEntrypoint),
        Chunking::SplitCommon => project.chunker(SplitCommon),
    };

    Ok(project)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    kobako::init_logging()?;

    let root = args
        .root
        .canonicalize_utf8()
        .with_context(|| format!("Couldn't open project root {}", args.root))?;

    let file = match &args.config {
        Some(path) => ProjectFile::load(&root.join(path), true)?,
        None => ProjectFile::load(&root.join(PROJECT_FILE), false)?,
    };

    let project = configure(root, file, &args)?;

    match args.mode {
        Mode::Build => {
            project.build()?;
        }
        Mode::Watch => {
            project.watch(&CancelToken::new())?;
        }
    }

    Ok(())
}
