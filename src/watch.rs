//! Rebuilds on file changes.
//!
//! Every source root is watched recursively. Events are debounced, and any
//! create, modify or remove event outside of the output directories triggers
//! a full [`Project::run`]. Only changed files are compiled again, the object
//! records take care of the rest.

use std::path::Path;
use std::sync::mpsc::{self, RecvError, RecvTimeoutError};
use std::time::Duration;

use camino::Utf8PathBuf;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;
use tracing::{error, info};

use crate::error::WatchError;
use crate::{CancelToken, KobakoError, Project};

const DEBOUNCE: Duration = Duration::from_millis(250);
/// How often the loop checks for cancellation while idle.
const POLL: Duration = Duration::from_millis(100);

pub(crate) fn watch(project: &Project, cancel: &CancelToken) -> Result<(), KobakoError> {
    info!("running initial build...");
    rebuild(project, cancel);

    let (tx, rx) = mpsc::channel();
    let mut debouncer = new_debouncer(DEBOUNCE, None, tx).map_err(WatchError::from)?;

    for source in project.sources_list() {
        let path = absolute(project.root().join(source));
        if path.is_dir() {
            info!("watching {}", path.display());
            debouncer
                .watch(&path, RecursiveMode::Recursive)
                .map_err(WatchError::from)?;
        }
    }

    let ignored = [project.build_root(), project.dist()].map(absolute);

    info!("initial build completed, now watching for changes...");

    loop {
        if cancel.is_cancelled() {
            info!("stopped watching");
            return Ok(());
        }

        match rx.recv_timeout(POLL) {
            Ok(Ok(events)) => {
                let changed = events
                    .iter()
                    .filter(|de| {
                        matches!(
                            de.event.kind,
                            EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                        )
                    })
                    .flat_map(|de| &de.event.paths)
                    .any(|path| !ignored.iter().any(|dir| path.starts_with(dir)));

                if changed {
                    info!("change detected, rebuilding...");
                    rebuild(project, cancel);
                }
            }
            Ok(Err(errors)) => {
                for err in errors {
                    error!("watch error: {err}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WatchError::from(RecvError).into());
            }
        }
    }
}

/// A failed build is reported, the watch goes on.
fn rebuild(project: &Project, cancel: &CancelToken) {
    match project.run(cancel) {
        Ok(manifest) => {
            for (specifier, entry) in manifest.iter() {
                info!("{specifier} -> {}", entry.file);
            }
        }
        Err(err) => error!("{err}"),
    }
}

/// Event paths are absolute, so the ignored directories have to be too.
fn absolute(path: Utf8PathBuf) -> std::path::PathBuf {
    let path: &Path = path.as_ref();
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
