use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use super::{Resource, ResourceError, ResourceId, ResourceMeta, WatchContext};

/// How often the file watcher samples the path for drift.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Desired presence of the managed path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// The file exists, with the configured content when one is given.
    Present,
    /// The file does not exist.
    Absent,
}

/// A plain-file resource: presence and (optionally) exact content.
#[derive(Debug)]
pub struct FileRes {
    name: String,
    path: PathBuf,
    content: Option<String>,
    state: FileState,
    meta: ResourceMeta,
    // set when an apply created the path, so a reverse teardown can undo it
    created: AtomicBool,
}

impl FileRes {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        content: Option<String>,
        state: FileState,
        meta: ResourceMeta,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content,
            state,
            meta,
            created: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn fingerprint(&self) -> Option<(u64, SystemTime)> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        Some((meta.len(), meta.modified().ok()?))
    }

    async fn content_matches(&self) -> Result<bool, ResourceError> {
        match &self.content {
            None => Ok(true),
            Some(want) => {
                let have = tokio::fs::read_to_string(&self.path).await?;
                Ok(have == *want)
            }
        }
    }
}

#[async_trait]
impl Resource for FileRes {
    fn id(&self) -> ResourceId {
        ResourceId::new("file", &self.name)
    }

    fn meta(&self) -> ResourceMeta {
        self.meta.clone()
    }

    fn validate(&self) -> Result<(), ResourceError> {
        if self.path.as_os_str().is_empty() {
            return Err(ResourceError::Validation(format!(
                "{}: empty path",
                self.id()
            )));
        }
        if !self.path.is_absolute() {
            return Err(ResourceError::Validation(format!(
                "{}: path must be absolute, got {}",
                self.id(),
                self.path.display()
            )));
        }
        if self.state == FileState::Absent && self.content.is_some() {
            return Err(ResourceError::Validation(format!(
                "{}: content is meaningless with state=absent",
                self.id()
            )));
        }
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), ResourceError> {
        let mut last = self.fingerprint().await;
        let mut ticker = tokio::time::interval(WATCH_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let now = self.fingerprint().await;
                    if now != last {
                        last = now;
                        if !ctx.notify() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn check_apply(&self, apply: bool) -> Result<bool, ResourceError> {
        let exists = tokio::fs::try_exists(&self.path).await?;
        match self.state {
            FileState::Present => {
                if exists && self.content_matches().await? {
                    return Ok(true);
                }
                if apply {
                    if let Some(parent) = self.path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let body = self.content.as_deref().unwrap_or("");
                    tokio::fs::write(&self.path, body).await?;
                    if !exists {
                        self.created.store(true, Ordering::Relaxed);
                    }
                }
                Ok(false)
            }
            FileState::Absent => {
                if !exists {
                    return Ok(true);
                }
                if apply {
                    tokio::fs::remove_file(&self.path).await?;
                }
                Ok(false)
            }
        }
    }

    fn compare(&self, other: &dyn Resource) -> bool {
        other.as_any().downcast_ref::<Self>().is_some_and(|o| {
            o.name == self.name
                && o.path == self.path
                && o.content == self.content
                && o.state == self.state
                && o.meta == self.meta
        })
    }

    /// A file under a managed directory must be applied after it: every
    /// ancestor path that is itself a file resource becomes a dependency.
    fn auto_edges(&self) -> Vec<ResourceId> {
        let mut deps = Vec::new();
        let mut cur = self.path.parent();
        while let Some(dir) = cur {
            if dir.as_os_str().is_empty() || dir == Path::new("/") {
                break;
            }
            deps.push(ResourceId::new("file", dir.to_string_lossy()));
            cur = dir.parent();
        }
        deps
    }

    async fn close(&self) -> Result<(), ResourceError> {
        if self.meta.reverse && self.created.load(Ordering::Relaxed) {
            debug!(id = %self.id(), "reverse teardown, removing created file");
            if let Err(err) = tokio::fs::remove_file(&self.path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
