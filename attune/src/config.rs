//! The graph definition source: a serde document describing resources per
//! kind plus edges between `kind:name` references.
//!
//! The engine does not care where the document came from; [`GraphConfig`]
//! deserializes from JSON and [`GraphConfig::into_graph`] builds a validated
//! resource graph. [`config_watch`] is the watch variant of the source
//! interface: a channel of readiness signals driven by mtime polling.
//!
//! ```json
//! {
//!   "graph": "webserver",
//!   "resources": {
//!     "file": [
//!       { "name": "motd", "path": "/etc/motd", "content": "hi\n", "state": "present" }
//!     ],
//!     "exec": [
//!       { "name": "reload", "cmd": "systemctl reload nginx" }
//!     ]
//!   },
//!   "edges": [
//!     { "name": "motd before reload",
//!       "from": { "kind": "file", "name": "motd" },
//!       "to":   { "kind": "exec", "name": "reload" } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::graphs::{Graph, GraphError};
use crate::resources::{ExecRes, FileRes, FileState, NoopRes, ResourceId, ResourceMeta};

/// How often a watched definition file is polled for changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read {path}")]
    #[diagnostic(code(attune::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse graph definition")]
    #[diagnostic(
        code(attune::config::parse),
        help("The definition must be a JSON document with resources and edges sections.")
    )]
    Parse(#[from] serde_json::Error),

    #[error("edge {edge:?} references unknown resource {id}")]
    #[diagnostic(code(attune::config::edge_ref))]
    EdgeRef { edge: String, id: ResourceId },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),
}

/// Reference to a resource by kind and name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResRef {
    pub kind: String,
    pub name: String,
}

impl ResRef {
    fn id(&self) -> ResourceId {
        ResourceId::new(&self.kind, &self.name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeConfig {
    #[serde(default)]
    pub name: String,
    pub from: ResRef,
    pub to: ResRef,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoopConfig {
    pub name: String,
    #[serde(default)]
    pub meta: ResourceMeta,
}

fn default_file_state() -> FileState {
    FileState::Present
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    pub name: String,
    /// Managed path; defaults to the resource name.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_file_state")]
    pub state: FileState,
    #[serde(default)]
    pub meta: ResourceMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecConfig {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub if_cmd: Option<String>,
    #[serde(default)]
    pub meta: ResourceMeta,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSection {
    #[serde(default)]
    pub noop: Vec<NoopConfig>,
    #[serde(default)]
    pub file: Vec<FileConfig>,
    #[serde(default)]
    pub exec: Vec<ExecConfig>,
}

/// A parsed graph definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphConfig {
    #[serde(default)]
    pub graph: String,
    #[serde(default)]
    pub resources: ResourceSection,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

impl GraphConfig {
    pub fn parse_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&body)
    }

    /// Build the resource graph this definition describes. The graph is
    /// structurally complete but not yet validated against drivers; callers
    /// run the rewrite passes and `validate` before activating it.
    pub fn into_graph(&self) -> Result<Graph, ConfigError> {
        let mut graph = Graph::new();
        for cfg in &self.resources.noop {
            graph.add_vertex(Arc::new(NoopRes::with_meta(&cfg.name, cfg.meta.clone())))?;
        }
        for cfg in &self.resources.file {
            let path = cfg.path.clone().unwrap_or_else(|| PathBuf::from(&cfg.name));
            graph.add_vertex(Arc::new(FileRes::new(
                &cfg.name,
                path,
                cfg.content.clone(),
                cfg.state,
                cfg.meta.clone(),
            )))?;
        }
        for cfg in &self.resources.exec {
            graph.add_vertex(Arc::new(ExecRes::new(
                &cfg.name,
                &cfg.cmd,
                cfg.if_cmd.clone(),
                cfg.meta.clone(),
            )))?;
        }
        for edge in &self.edges {
            let from = graph
                .index_of(&edge.from.id())
                .ok_or_else(|| ConfigError::EdgeRef {
                    edge: edge.name.clone(),
                    id: edge.from.id(),
                })?;
            let to = graph
                .index_of(&edge.to.id())
                .ok_or_else(|| ConfigError::EdgeRef {
                    edge: edge.name.clone(),
                    id: edge.to.id(),
                })?;
            graph.add_edge(from, to, edge.name.clone(), edge.notify)?;
        }
        debug!(
            graph = %self.graph,
            vertices = graph.len(),
            edges = graph.edges().len(),
            "built graph from definition"
        );
        Ok(graph)
    }
}

/// Watch a definition file by polling its mtime. Sends `true` whenever the
/// file looks changed; the channel closes when `cancel` fires.
pub fn config_watch(path: PathBuf, cancel: CancellationToken) -> flume::Receiver<bool> {
    let (tx, rx) = flume::bounded(1);
    tokio::spawn(async move {
        let fingerprint = |p: &Path| {
            std::fs::metadata(p)
                .ok()
                .map(|m| (m.len(), m.modified().ok()))
        };
        let mut last = fingerprint(&path);
        let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let now = fingerprint(&path);
                    if now != last {
                        last = now;
                        trace!(path = %path.display(), "definition file changed");
                        // a full slot already means "recompile pending"
                        let _ = tx.try_send(true);
                    }
                }
            }
        }
    });
    rx
}
