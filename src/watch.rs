//! Watch mode keeps a set of top-level tasks up to date while files change.
//!
//! 1. **File watcher**: the `notify` crate monitors the static roots of the
//!    given globs recursively, with debouncing so that a burst of saves
//!    results in one rebuild.
//! 2. **Rebuild**: every relevant batch of events opens a fresh
//!    [`Session`], which re-checks the targets top-down. Resources that did
//!    not change are not read again, and only tasks that observed a change
//!    are executed.

use std::fmt::Display;
use std::path::Path;
use std::sync::mpsc::{RecvError, RecvTimeoutError};
use std::time::{Duration, Instant};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::Style;
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_full::new_debouncer;

use crate::core::Payload;
use crate::engine::{CancelHandle, Diagnostics, EngineHandle, Session, Workbench};
use crate::error::{Result, WatchError};
use crate::task::TaskId;

const ANSI_BLUE: Style = Style::new().blue();

fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// The outcome of one pass over the targets.
pub struct Rebuild {
    pub outputs: Result<Vec<Payload>>,
    pub diagnostics: Diagnostics,
}

/// Brings every target up to date in a single fresh session.
pub fn rebuild(workbench: &Workbench, engine: EngineHandle, targets: &[TaskId]) -> Result<Rebuild> {
    let session: Session<'_> = workbench.session(engine)?;
    let outputs = targets.iter().map(|task| session.require(task)).collect();

    Ok(Rebuild {
        outputs,
        diagnostics: session.diagnostics(),
    })
}

/// Rebuilds `targets` on every change to a file matching one of `globs`,
/// until `stop` is cancelled. `on_build` sees the outcome of each pass,
/// including the initial one.
pub fn watch(
    workbench: &Workbench,
    engine: EngineHandle,
    targets: &[TaskId],
    globs: &[&str],
    stop: &CancelHandle,
    mut on_build: impl FnMut(&Rebuild),
) -> std::result::Result<(), WatchError> {
    tracing::info!("running initial build...");
    run_pass(workbench, engine, targets, &mut on_build);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)?;

    let mut watched = Vec::new();
    for glob in globs {
        match WatchTarget::new(glob) {
            Ok(target) => watched.push(target),
            Err(e) => tracing::error!("failed to resolve path {glob}: {e}"),
        }
    }

    for root in watch_roots(&watched) {
        tracing::info!("watching {root}");
        debouncer.watch(root, RecursiveMode::Recursive)?;
    }

    tracing::info!("initial build completed, now watching for changes...");

    while !stop.is_cancelled() {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                let relevant = events
                    .iter()
                    .flat_map(|event| &event.event.paths)
                    .any(|path| watched.iter().any(|target| target.matches(path)));

                if relevant {
                    tracing::info!("change detected, re-checking targets...");
                    run_pass(workbench, engine, targets, &mut on_build);
                }
            }
            Ok(Err(errors)) => {
                for e in errors {
                    tracing::error!("watch error: {e:?}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(RecvError.into()),
        }
    }

    Ok(())
}

fn run_pass(
    workbench: &Workbench,
    engine: EngineHandle,
    targets: &[TaskId],
    on_build: &mut impl FnMut(&Rebuild),
) {
    let s = Instant::now();

    let result = match rebuild(workbench, engine, targets) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("couldn't start a session: {e}");
            return;
        }
    };

    match &result.outputs {
        Ok(_) => tracing::info!(
            "executed {} tasks, reused {} {}",
            result.diagnostics.executed_count(),
            result.diagnostics.reused,
            as_overhead(s)
        ),
        Err(e) => tracing::error!("build failed: {e}"),
    }

    on_build(&result);
}

/// A glob split into the directory handed to the watcher and the absolute
/// pattern that events are matched against.
#[derive(Debug)]
pub struct WatchTarget {
    pub root: Utf8PathBuf,
    pub pattern: Pattern,
}

impl WatchTarget {
    /// The literal leading components of `glob` must exist. A glob naming a
    /// single file watches the file's directory, so atomic replacements of
    /// the file are seen.
    pub fn new(glob: impl AsRef<str>) -> std::result::Result<Self, WatchError> {
        let glob = Utf8Path::new(glob.as_ref());
        let is_wild = |c: &Utf8Component<'_>| c.as_str().contains(['*', '?', '[']);

        let literal: Utf8PathBuf = glob.components().take_while(|c| !is_wild(c)).collect();
        let wild: Utf8PathBuf = glob.components().skip_while(|c| !is_wild(c)).collect();

        let literal = literal.canonicalize_utf8()?;
        let pattern = match wild.as_str() {
            "" => Pattern::new(literal.as_str())?,
            _ => Pattern::new(literal.join(&wild).as_str())?,
        };

        let root = if wild.as_str().is_empty() && literal.is_file() {
            literal
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| literal.clone())
        } else {
            literal
        };

        Ok(Self { root, pattern })
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern.matches_path(path)
    }
}

/// Roots to hand to the recursive watcher, without any root that lies
/// inside another one.
fn watch_roots(targets: &[WatchTarget]) -> Vec<&Utf8Path> {
    let mut roots: Vec<&Utf8Path> = targets.iter().map(|target| target.root.as_path()).collect();
    roots.sort();
    roots.dedup_by(|inner, outer| inner.starts_with(&*outer));
    roots
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::engine::ExecContext;
    use crate::registry::TaskRegistry;
    use crate::resource::{FsResolver, ResolverChain, ResourceKey};

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let root = root.canonicalize_utf8().unwrap();
        (dir, root)
    }

    #[test]
    fn test_file_target_watches_its_directory() {
        let (_dir, root) = temp_root();
        fs::create_dir(root.join("lang")).unwrap();
        fs::write(root.join("lang/main.str"), "module main").unwrap();

        let target = WatchTarget::new(root.join("lang/main.str")).unwrap();

        assert_eq!(target.root, root.join("lang"));
        assert!(target.matches(root.join("lang/main.str").as_std_path()));
        assert!(!target.matches(root.join("lang/other.str").as_std_path()));
    }

    #[test]
    fn test_wildcard_target_matches_nested_files() {
        let (_dir, root) = temp_root();
        fs::create_dir_all(root.join("lang/syntax")).unwrap();

        let target = WatchTarget::new(root.join("lang/**/*.sdf3")).unwrap();

        assert_eq!(target.root, root.join("lang"));
        assert!(target.matches(root.join("lang/syntax/Main.sdf3").as_std_path()));
        assert!(!target.matches(root.join("lang/syntax/Main.str").as_std_path()));
        assert!(!target.matches(root.join("docs/Main.sdf3").as_std_path()));
    }

    #[test]
    fn test_target_needs_an_existing_root() {
        let (_dir, root) = temp_root();
        assert!(WatchTarget::new(root.join("gone/**/*.str")).is_err());
    }

    #[test]
    fn test_roots_fold_into_enclosing_directory() {
        let (_dir, root) = temp_root();
        fs::create_dir_all(root.join("lang/syntax")).unwrap();
        fs::write(root.join("build.cfg"), "").unwrap();

        let targets = [
            WatchTarget::new(root.join("lang/syntax/*.sdf3")).unwrap(),
            WatchTarget::new(root.join("lang/**/*.str")).unwrap(),
            WatchTarget::new(root.join("build.cfg")).unwrap(),
        ];

        assert_eq!(watch_roots(&targets), vec![root.as_path()]);
    }

    #[test]
    fn test_roots_keep_sibling_prefixes() {
        let (_dir, root) = temp_root();
        fs::create_dir(root.join("lang")).unwrap();
        fs::create_dir(root.join("lang-ext")).unwrap();

        let targets = [
            WatchTarget::new(root.join("lang-ext/*.str")).unwrap(),
            WatchTarget::new(root.join("lang/*.str")).unwrap(),
        ];

        assert_eq!(
            watch_roots(&targets),
            vec![root.join("lang").as_path(), root.join("lang-ext").as_path()]
        );
    }

    #[test]
    fn test_rebuild_picks_up_file_changes() {
        let (_dir, root) = temp_root();
        fs::write(root.join("main.str"), "module main").unwrap();

        let mut registry = TaskRegistry::new();
        registry
            .register_fn("lines", |ctx: &mut ExecContext<'_>, id: String| {
                let text = ctx.read_to_string(&ResourceKey::new("str", id))?;
                Ok(text.lines().count())
            })
            .unwrap();

        let mut workbench = Workbench::new();
        let engine = workbench
            .engine("stratego")
            .tasks(registry)
            .resolver(
                ResolverChain::builder()
                    .resolver("fs", FsResolver::new("str", &root))
                    .build(),
            )
            .build()
            .unwrap();

        let targets = [TaskId::new("lines", "main.str").unwrap()];

        let first = rebuild(&workbench, engine, &targets).unwrap();
        assert_eq!(first.outputs.unwrap()[0].decode::<usize>().unwrap(), 1);
        assert_eq!(first.diagnostics.executed_count(), 1);

        let second = rebuild(&workbench, engine, &targets).unwrap();
        assert_eq!(second.diagnostics.executed_count(), 0);

        fs::write(root.join("main.str"), "module main\n\nimports std").unwrap();
        let third = rebuild(&workbench, engine, &targets).unwrap();
        assert_eq!(third.outputs.unwrap()[0].decode::<usize>().unwrap(), 3);
        assert_eq!(third.diagnostics.executed_count(), 1);
    }
}
