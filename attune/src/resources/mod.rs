//! The resource contract: the capability set every resource kind satisfies.
//!
//! A resource is a named, typed unit of desired state. The engine never looks
//! inside a resource's parameters; it only drives the capability set defined
//! by [`Resource`]:
//!
//! - **Watch**: block until cancelled, emitting a signal whenever the
//!   real-world state this resource describes may have drifted.
//! - **CheckApply**: observe the world and, when `apply` is true, converge it
//!   toward the desired state. Returns `Ok(true)` iff the observed state
//!   already satisfied the desired state at the moment of the call.
//! - **Compare**: parameter-level equality, used to carry live vertices
//!   across a graph swap.
//!
//! `check_apply` must be idempotent, and with `apply = false` it must not
//! mutate anything. Errors from drivers are always transient: the engine logs
//! them and re-drives the vertex with backoff.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod exec;
mod file;
mod group;
mod noop;

pub use exec::ExecRes;
pub use file::{FileRes, FileState};
pub use group::ResourceGroup;
pub use noop::NoopRes;

/// Errors produced by resource drivers.
///
/// None of these are fatal to the process: configuration-time variants are
/// reported at parse/validate time and runtime variants cause a bounded
/// retry of the owning vertex.
#[derive(Debug, Error, Diagnostic)]
pub enum ResourceError {
    /// The resource parameters are invalid.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(attune::resources::validation),
        help("Fix the resource definition in the graph source.")
    )]
    Validation(String),

    /// An apply or observation against the real world failed.
    #[error("apply failed: {0}")]
    #[diagnostic(code(attune::resources::apply))]
    Apply(String),

    /// The watcher could not observe the external world.
    #[error("watch failed: {0}")]
    #[diagnostic(code(attune::resources::watch))]
    Watch(String),

    #[error(transparent)]
    #[diagnostic(code(attune::resources::io))]
    Io(#[from] std::io::Error),
}

/// Stable identity of a resource: kind plus name.
///
/// At most one vertex per identity may exist in a graph, and deterministic
/// engine passes iterate identities in `(kind, name)` order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.name)
    }
}

/// Runtime flags attached to every resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceMeta {
    /// Compute the difference but never mutate the world.
    #[serde(default)]
    pub noop: bool,
    /// Apply the inverse on teardown. The engine guarantees `close` runs on
    /// teardown; drivers honoring `reverse` undo their work there.
    #[serde(default)]
    pub reverse: bool,
    /// Grouping key for the auto-group pass. Vertices of the same kind with
    /// equal keys may be merged into one composite vertex.
    #[serde(default)]
    pub autogroup: Option<String>,
}

/// Context handed to [`Resource::watch`].
///
/// The driver emits a unit signal on `signals` whenever the watched state may
/// have changed, and must return promptly once `cancel` fires. Pause/resume
/// is handled above the driver: the engine keeps draining signals while the
/// vertex is paused so drivers never buffer unboundedly.
#[derive(Clone)]
pub struct WatchContext {
    pub signals: flume::Sender<()>,
    pub cancel: CancellationToken,
}

impl WatchContext {
    /// Report a possible change in the watched state.
    ///
    /// Returns `false` if the engine side has gone away; drivers should then
    /// return from `watch`.
    pub fn notify(&self) -> bool {
        self.signals.try_send(()).is_ok()
    }
}

/// The capability set every resource kind implements.
///
/// Object-safe; the graph stores `Arc<dyn Resource>` and the engine
/// dispatches through it. `as_any` exists so `compare` implementations can
/// downcast their peer to the concrete kind.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Unique kind + name identity.
    fn id(&self) -> ResourceId;

    /// Runtime flags. The default has everything off.
    fn meta(&self) -> ResourceMeta {
        ResourceMeta::default()
    }

    /// One-time setup, called before the first start of a graph.
    async fn init(&self) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Static parameter validation, called at graph build time.
    fn validate(&self) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Block until `ctx.cancel` fires, emitting a signal on `ctx.signals`
    /// whenever the external state may have drifted.
    ///
    /// The default implementation watches nothing and simply waits for
    /// cancellation, which suits resources without an external observer.
    async fn watch(&self, ctx: WatchContext) -> Result<(), ResourceError> {
        ctx.cancel.cancelled().await;
        Ok(())
    }

    /// Observe the world and, iff `apply`, converge it.
    ///
    /// Returns `Ok(true)` when the observed state already satisfied the
    /// desired state at the moment of the call. With `apply = false` the
    /// driver must not mutate anything.
    async fn check_apply(&self, apply: bool) -> Result<bool, ResourceError>;

    /// Parameter-level equality with another resource, used for identity
    /// matching during a graph swap.
    fn compare(&self, other: &dyn Resource) -> bool;

    /// Automatic dependencies this resource implies, in driver order.
    ///
    /// The auto-edge pass adds an edge from each returned identity (when
    /// present in the graph) to this resource.
    fn auto_edges(&self) -> Vec<ResourceId> {
        Vec::new()
    }

    /// Teardown, called exactly once when the owning vertex is destroyed.
    async fn close(&self) -> Result<(), ResourceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a resource as stored in a graph.
pub type ResourceHandle = Arc<dyn Resource>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_orders_by_kind_then_name() {
        let a = ResourceId::new("exec", "zz");
        let b = ResourceId::new("file", "aa");
        assert!(a < b);
        assert_eq!(ResourceId::new("file", "x"), ResourceId::new("file", "x"));
    }

    #[test]
    fn id_display() {
        assert_eq!(ResourceId::new("file", "motd").to_string(), "file[motd]");
    }

    #[test]
    fn meta_defaults_off() {
        let meta = ResourceMeta::default();
        assert!(!meta.noop);
        assert!(!meta.reverse);
        assert!(meta.autogroup.is_none());
    }
}
