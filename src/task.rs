//! Task definitions and task identifiers.
//!
//! A [`TaskDef`] is a named, memoizable computation. The engine never sees the
//! typed arguments and outputs directly. Instead, every definition is wrapped
//! into a type-erased [`ErasedTaskDef`] that speaks [`Payload`]s, and every
//! invocation is named by a [`TaskId`] made of the definition's kind and the
//! encoded arguments.
//!
//! ## Phantom-free typing
//!
//! * **Compile-time**: [`TaskDef::Args`] and [`TaskDef::Output`] let callers use
//!   [`TaskId::of`] and [`ExecContext::require_task`] without touching bytes.
//! * **Runtime**: the engine compares fingerprints of payloads only, so a
//!   mismatch between what a caller expects and what a task produced surfaces
//!   as a [`PayloadError`] on decode instead of a panic.

use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Blake3Hasher, Hash32, Payload};
use crate::engine::ExecContext;
use crate::error::PayloadError;

/// A typed task definition.
///
/// # Example
///
/// ```rust
/// use tsumiki::{ExecContext, TaskDef};
///
/// struct Square;
///
/// impl TaskDef for Square {
///     const KIND: &'static str = "square";
///     type Args = u64;
///     type Output = u64;
///
///     fn execute(&self, _: &mut ExecContext<'_>, x: u64) -> anyhow::Result<u64> {
///         Ok(x * x)
///     }
/// }
/// ```
pub trait TaskDef: Send + Sync + 'static {
    /// Registry key of this definition. Must be unique across every engine
    /// that ends up composed together.
    const KIND: &'static str;

    type Args: Serialize + DeserializeOwned + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Bumping the version invalidates all recorded traces of this kind,
    /// including the ones persisted by earlier runs.
    fn version(&self) -> u32 {
        0
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, args: Self::Args)
    -> anyhow::Result<Self::Output>;
}

/// The type-erased foundation that lets a registry hold definitions with
/// different argument and output types.
pub(crate) trait ErasedTaskDef: Send + Sync {
    fn kind(&self) -> &str;

    fn version(&self) -> u32;

    fn output_type_name(&self) -> &'static str;

    fn execute(&self, ctx: &mut ExecContext<'_>, args: &Payload) -> anyhow::Result<Payload>;
}

/// Bridges a [`TaskDef`] into an [`ErasedTaskDef`]. This is where the type
/// erasure actually happens.
pub(crate) struct Typed<D>(pub(crate) D);

impl<D> ErasedTaskDef for Typed<D>
where
    D: TaskDef,
{
    fn kind(&self) -> &str {
        D::KIND
    }

    fn version(&self) -> u32 {
        self.0.version()
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<D::Output>()
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, args: &Payload) -> anyhow::Result<Payload> {
        let args = args.decode::<D::Args>()?;
        let output = self.0.execute(ctx, args)?;
        Ok(Payload::encode(&output)?)
    }
}

/// A task definition backed by a closure, for kinds only known at runtime.
pub struct FnTask<A, O, F> {
    kind: ArcStr,
    version: u32,
    callback: F,
    _phantom: PhantomData<fn(A) -> O>,
}

impl<A, O, F> FnTask<A, O, F>
where
    A: DeserializeOwned + 'static,
    O: Serialize + 'static,
    F: Fn(&mut ExecContext<'_>, A) -> anyhow::Result<O> + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<ArcStr>, callback: F) -> Self {
        Self {
            kind: kind.into(),
            version: 0,
            callback,
            _phantom: PhantomData,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl<A, O, F> ErasedTaskDef for FnTask<A, O, F>
where
    A: DeserializeOwned + 'static,
    O: Serialize + 'static,
    F: Fn(&mut ExecContext<'_>, A) -> anyhow::Result<O> + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<O>()
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, args: &Payload) -> anyhow::Result<Payload> {
        let args = args.decode::<A>()?;
        let output = (self.callback)(ctx, args)?;
        Ok(Payload::encode(&output)?)
    }
}

/// Identifies one invocation of a task: the definition's kind plus the
/// encoded arguments. Equality and hashing are structural, which makes a
/// `TaskId` usable as the cache key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    kind: ArcStr,
    args: Payload,
}

impl TaskId {
    pub fn new<A>(kind: impl Into<ArcStr>, args: &A) -> Result<Self, PayloadError>
    where
        A: Serialize + ?Sized,
    {
        Ok(Self::from_payload(kind, Payload::encode(args)?))
    }

    /// Builds the identifier of the typed definition `D` applied to `args`.
    pub fn of<D>(args: &D::Args) -> Result<Self, PayloadError>
    where
        D: TaskDef,
    {
        Self::new(D::KIND, args)
    }

    pub fn from_payload(kind: impl Into<ArcStr>, args: Payload) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn args(&self) -> &Payload {
        &self.args
    }

    /// Content address of this identifier, used to name persisted traces.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        hasher
            .update(self.kind.as_bytes())
            .update(self.args.as_bytes());
        hasher.into()
    }

    /// Fingerprint of the arguments under a given definition version.
    pub(crate) fn args_fingerprint(&self, version: u32) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        hasher
            .update(&version.to_le_bytes())
            .update(self.args.as_bytes());
        hasher.into()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.args.hash().short())
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Square;

    impl TaskDef for Square {
        const KIND: &'static str = "square";
        type Args = u64;
        type Output = u64;

        fn execute(&self, _: &mut ExecContext<'_>, x: u64) -> anyhow::Result<u64> {
            Ok(x * x)
        }
    }

    #[test]
    fn test_task_id_structural() {
        let a = TaskId::of::<Square>(&4).unwrap();
        let b = TaskId::new("square", &4u64).unwrap();
        let c = TaskId::of::<Square>(&5).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_task_id_kind_matters() {
        let a = TaskId::new("square", &4u64).unwrap();
        let b = TaskId::new("cube", &4u64).unwrap();

        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.args(), b.args());
    }

    #[test]
    fn test_version_changes_fingerprint() {
        let id = TaskId::of::<Square>(&4).unwrap();
        assert_ne!(id.args_fingerprint(0), id.args_fingerprint(1));
        assert_eq!(id.args_fingerprint(2), id.args_fingerprint(2));
    }

    #[test]
    fn test_display() {
        let id = TaskId::of::<Square>(&4).unwrap();
        let shown = id.to_string();
        assert!(shown.starts_with("square#"));
        assert_eq!(shown.len(), "square#".len() + 8);
    }
}
