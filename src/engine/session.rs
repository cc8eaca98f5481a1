use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use petgraph::graph::NodeIndex;
use serde::de::DeserializeOwned;
use tracing::{Span, debug, info_span};

use crate::core::Payload;
use crate::engine::diagnostics::{Diagnostics, TaskExecution};
use crate::engine::inflight::Slot;
use crate::engine::trace::{Dependency, TraceRecord};
use crate::engine::{EngineHandle, Workbench};
use crate::error::{Error, Result, TaskPath};
use crate::registry::TaskDefPtr;
use crate::resource::{Content, ResourceKey, Stamp};
use crate::task::{TaskDef, TaskId};

/// Cooperative cancellation for a running session.
///
/// Cancelling makes every pending requirement in the session fail with
/// [`Error::Cancelled`]. Tasks that are already executing finish first; the
/// flag is observed between tasks and between dependency checks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One top-down evaluation against a single engine.
///
/// Within a session, each task is brought up to date at most once; later
/// requirements of the same task return the output settled the first time.
/// Changes to resources made while a session is running may or may not be
/// observed by it, so start a new session to pick them up.
pub struct Session<'w> {
    workbench: &'w Workbench,
    engine: NodeIndex,
    settled: Mutex<HashMap<Slot, Payload>>,
    stashed: Mutex<HashMap<Slot, Error>>,
    cancel: CancelHandle,
    parallel: bool,
    diagnostics: Mutex<Diagnostics>,
}

impl<'w> Session<'w> {
    pub(crate) fn new(workbench: &'w Workbench, engine: NodeIndex) -> Self {
        Self {
            workbench,
            engine,
            settled: Mutex::default(),
            stashed: Mutex::default(),
            cancel: CancelHandle::default(),
            parallel: true,
            diagnostics: Mutex::default(),
        }
    }

    /// Makes [`ExecContext::require_all`] evaluate its tasks one by one on
    /// the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Shares cancellation with an existing handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn engine(&self) -> EngineHandle {
        EngineHandle(self.engine)
    }

    /// Brings `task` up to date and returns its output.
    pub fn require(&self, task: &TaskId) -> Result<Payload> {
        self.require_from(None, &[], self.engine, task)
    }

    /// Typed variant of [`require`](Self::require).
    pub fn get<D>(&self, args: &D::Args) -> Result<D::Output>
    where
        D: TaskDef,
    {
        let task = TaskId::of::<D>(args)?;
        Ok(self.require(&task)?.decode()?)
    }

    /// Snapshot of what this session did so far.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn settled(&self, slot: &Slot) -> Option<Payload> {
        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(slot)
            .cloned()
    }

    /// Keeps the failure of a dependency found while checking a dependent,
    /// so the dependent's re-execution gets it back instead of running the
    /// failing task a second time.
    fn stash(&self, from: NodeIndex, task: &TaskId, err: Error) {
        if let Ok((owner, _)) = self.workbench.owner_of(from, task.kind()) {
            self.stashed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert((owner, task.clone()), err);
        }
    }

    fn unstash(&self, slot: &Slot) -> Option<Error> {
        self.stashed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(slot)
    }

    /// `parent` is the task doing the requiring, `path` the chain of tasks
    /// leading to it and `from` the engine whose scope resolves the kind.
    fn require_from(
        &self,
        parent: Option<&Slot>,
        path: &[TaskId],
        from: NodeIndex,
        task: &TaskId,
    ) -> Result<Payload> {
        self.check_cancelled()?;

        let (owner, def) = self.workbench.owner_of(from, task.kind())?;
        let slot = (owner, task.clone());

        if let Some(output) = self.settled(&slot) {
            return Ok(output);
        }

        if let Some(err) = self.unstash(&slot) {
            return Err(err);
        }

        let mut path = path.to_vec();
        path.push(task.clone());

        let _wait = self
            .workbench
            .inflight
            .wait(parent, &slot)
            .map_err(|cycle| Error::CyclicDependency {
                path: TaskPath(entered_first(cycle, &path)),
            })?;

        let _claim = self.workbench.inflight.claim(&slot);

        // Someone else might have settled it while we were waiting.
        if let Some(output) = self.settled(&slot) {
            return Ok(output);
        }

        let output = self.bring_up_to_date(&slot, def, &path)?;

        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot, output.clone());

        Ok(output)
    }

    fn bring_up_to_date(&self, slot: &Slot, def: &TaskDefPtr, path: &[TaskId]) -> Result<Payload> {
        let (owner, task) = slot;
        let store = &self.workbench.graph[*owner].store;
        let args = task.args_fingerprint(def.version());

        let reason = match store.get(task) {
            None => "no trace".to_string(),
            Some(record) if record.args != args => "definition changed".to_string(),
            Some(record) => match self.first_inconsistency(slot, &record, path)? {
                None => {
                    debug!(task = %task, "up to date");
                    self.diagnostics
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .reused += 1;
                    return Ok(record.output.clone());
                }
                Some(reason) => reason,
            },
        };

        debug!(task = %task, reason = %reason, "executing");
        self.execute(slot, def, path)
    }

    /// Walks the recorded dependencies in order and returns why the first
    /// inconsistent one is stale. Task dependencies are brought up to date
    /// along the way.
    fn first_inconsistency(
        &self,
        slot: &Slot,
        record: &TraceRecord,
        path: &[TaskId],
    ) -> Result<Option<String>> {
        let owner = slot.0;
        let resolver = &self.workbench.graph[owner].resolver;

        for dep in &record.dependencies {
            self.check_cancelled()?;

            match dep {
                Dependency::Task { task, output } => {
                    match (self.require_from(Some(slot), path, owner, task), output) {
                        (Ok(current), Some(output)) if current.hash() == *output => {}
                        (Ok(_), _) => return Ok(Some(format!("output of {task} changed"))),
                        (Err(Error::UnknownTask { .. }), _) => {
                            return Ok(Some(format!("{} is no longer registered", task.kind())));
                        }
                        (Err(e @ Error::Cancelled), _) => return Err(e),
                        // Failed before and fails again.
                        (Err(_), None) => {}
                        (Err(e), Some(_)) => {
                            self.stash(owner, task, e);
                            return Ok(Some(format!("{task} failed")));
                        }
                    }
                }
                Dependency::Resource { key, stamp } => {
                    if resolver.stamp(key)? != *stamp {
                        return Ok(Some(format!("resource {key} changed")));
                    }
                }
            }
        }

        Ok(None)
    }

    fn execute(&self, slot: &Slot, def: &TaskDefPtr, path: &[TaskId]) -> Result<Payload> {
        self.check_cancelled()?;

        let (owner, task) = slot;
        let node = &self.workbench.graph[*owner];

        let span = info_span!("task", task = %task, engine = %node.name);
        let _enter = span.enter();

        let mut ctx = ExecContext {
            session: self,
            engine: *owner,
            slot,
            path,
            dependencies: Vec::new(),
        };

        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| def.execute(&mut ctx, task.args())))
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());

                Err(anyhow::anyhow!("Task panicked: {message}"))
            });
        let duration = start.elapsed();
        let dependencies = ctx.dependencies;

        let output = match result {
            Ok(output) => output,
            Err(err) => return Err(wrap_failure(err, path)),
        };

        debug!(dependencies = dependencies.len(), "finished in {duration:.2?}");

        node.store.insert(TraceRecord {
            task: task.clone(),
            args: task.args_fingerprint(def.version()),
            output: output.clone(),
            dependencies,
        })?;

        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .executed
            .push(TaskExecution {
                task: task.clone(),
                engine: node.name.clone(),
                start,
                duration,
            });

        Ok(output)
    }
}

/// Rotates a closed cycle so that it starts at the member the evaluation
/// reached first.
fn entered_first(cycle: Vec<TaskId>, path: &[TaskId]) -> Vec<TaskId> {
    let ring = &cycle[..cycle.len().saturating_sub(1)];

    let Some(start) = ring
        .iter()
        .enumerate()
        .filter_map(|(i, task)| path.iter().position(|seen| seen == task).map(|depth| (depth, i)))
        .min()
        .map(|(_, i)| i)
    else {
        return cycle;
    };

    let mut rotated: Vec<TaskId> = ring[start..].iter().chain(&ring[..start]).cloned().collect();
    rotated.push(ring[start].clone());
    rotated
}

/// Errors that already know where they happened are passed through, so the
/// outermost caller sees the deepest one. Everything else is attributed to
/// the task that raised it.
fn wrap_failure(err: anyhow::Error, path: &[TaskId]) -> Error {
    match err.downcast::<Error>() {
        Ok(inner @ (Error::TaskExecution { .. } | Error::CyclicDependency { .. } | Error::Cancelled)) => inner,
        Ok(inner) => Error::TaskExecution {
            path: TaskPath(path.to_vec()),
            source: inner.into(),
        },
        Err(source) => Error::TaskExecution {
            path: TaskPath(path.to_vec()),
            source,
        },
    }
}

/// The handle a task uses to observe the world while it executes.
///
/// Every requirement and every resource access made through the context is
/// recorded, in order, as a dependency of the executing task.
pub struct ExecContext<'a> {
    session: &'a Session<'a>,
    engine: NodeIndex,
    slot: &'a Slot,
    path: &'a [TaskId],
    dependencies: Vec<Dependency>,
}

impl ExecContext<'_> {
    /// The task being executed.
    pub fn task(&self) -> &TaskId {
        &self.slot.1
    }

    /// Name of the engine that owns the executing task.
    pub fn engine_name(&self) -> &str {
        &self.session.workbench.graph[self.engine].name
    }

    /// Requires another task, resolved in the scope of the engine that owns
    /// the executing task. A failure is recorded too, so a task that gets
    /// over it re-runs once the required task succeeds.
    pub fn require(&mut self, task: &TaskId) -> Result<Payload> {
        let result = self
            .session
            .require_from(Some(self.slot), self.path, self.engine, task);

        self.dependencies.push(Dependency::Task {
            task: task.clone(),
            output: result.as_ref().ok().map(Payload::hash),
        });

        result
    }

    /// Typed variant of [`require`](Self::require).
    pub fn require_task<D>(&mut self, args: &D::Args) -> Result<D::Output>
    where
        D: TaskDef,
    {
        let task = TaskId::of::<D>(args)?;
        Ok(self.require(&task)?.decode()?)
    }

    /// Requires several tasks at once. Unless the session is sequential they
    /// are brought up to date on scoped threads, but the dependencies are
    /// recorded in list order either way. When several of them fail, the
    /// first failure in list order is returned.
    pub fn require_all(&mut self, tasks: &[TaskId]) -> Result<Vec<Payload>> {
        let session = self.session;
        let (slot, path, engine) = (self.slot, self.path, self.engine);
        let require = |task: &TaskId| session.require_from(Some(slot), path, engine, task);

        let results: Vec<Result<Payload>> = if session.parallel && tasks.len() > 1 {
            let workers = std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
                .min(tasks.len());
            let chunk = tasks.len().div_ceil(workers);
            let span = Span::current();

            std::thread::scope(|s| {
                let handles: Vec<_> = tasks
                    .chunks(chunk)
                    .map(|chunk| {
                        let span = span.clone();
                        let handle = s.spawn(move || {
                            let _enter = span.enter();
                            chunk.iter().map(require).collect::<Vec<_>>()
                        });
                        (chunk.len(), handle)
                    })
                    .collect();

                handles
                    .into_iter()
                    .flat_map(|(len, handle)| match handle.join() {
                        Ok(results) => results,
                        Err(_) => (0..len)
                            .map(|_| {
                                Err(Error::TaskExecution {
                                    path: TaskPath(path.to_vec()),
                                    source: anyhow::anyhow!("Worker thread panicked"),
                                })
                            })
                            .collect(),
                    })
                    .collect()
            })
        } else {
            tasks.iter().map(require).collect()
        };

        for (task, result) in tasks.iter().zip(&results) {
            self.dependencies.push(Dependency::Task {
                task: task.clone(),
                output: result.as_ref().ok().map(Payload::hash),
            });
        }

        results.into_iter().collect()
    }

    /// Decodes every output of [`require_all`](Self::require_all) as `T`.
    pub fn require_all_as<T>(&mut self, tasks: &[TaskId]) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.require_all(tasks)?
            .iter()
            .map(|output| Ok(output.decode()?))
            .collect()
    }

    /// Reads a resource, failing when no resolver claims it.
    pub fn read(&mut self, key: &ResourceKey) -> Result<Content> {
        self.try_read(key)?
            .ok_or_else(|| Error::UnresolvedResource(key.clone()))
    }

    /// Reads a resource. A missing resource is still recorded, so the task
    /// re-runs once something starts claiming the key.
    pub fn try_read(&mut self, key: &ResourceKey) -> Result<Option<Content>> {
        let resolver = &self.session.workbench.graph[self.engine].resolver;

        // Stamp before reading: a change in between makes the next session
        // re-run the task rather than miss the change.
        let stamp = resolver.stamp(key)?;
        let content = resolver.try_resolve(key)?;

        self.dependencies.push(Dependency::Resource {
            key: key.clone(),
            stamp,
        });

        Ok(content)
    }

    pub fn read_to_string(&mut self, key: &ResourceKey) -> Result<String> {
        let content = self.read(key)?;
        let text = content.to_str().map_err(|e| Error::Resource {
            key: key.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        Ok(text.to_string())
    }

    /// Records the current stamp of a resource without reading it.
    pub fn stamp(&mut self, key: &ResourceKey) -> Result<Stamp> {
        let stamp = self.session.workbench.graph[self.engine].resolver.stamp(key)?;

        self.dependencies.push(Dependency::Resource {
            key: key.clone(),
            stamp,
        });

        Ok(stamp)
    }
}
