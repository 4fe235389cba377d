use std::any::Any;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Resource, ResourceError, ResourceId, ResourceMeta};

/// An idempotent command pair: a probe deciding whether work is needed and a
/// command that performs it.
///
/// With an `if_cmd`, state is satisfied when the probe exits non-zero. Without
/// one, the command runs once per process lifetime.
#[derive(Debug)]
pub struct ExecRes {
    name: String,
    cmd: String,
    if_cmd: Option<String>,
    meta: ResourceMeta,
    ran: AtomicBool,
}

impl ExecRes {
    pub fn new(
        name: impl Into<String>,
        cmd: impl Into<String>,
        if_cmd: Option<String>,
        meta: ResourceMeta,
    ) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            if_cmd,
            meta,
            ran: AtomicBool::new(false),
        }
    }

    async fn run_shell(cmd: &str) -> Result<std::process::ExitStatus, ResourceError> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status)
    }
}

#[async_trait]
impl Resource for ExecRes {
    fn id(&self) -> ResourceId {
        ResourceId::new("exec", &self.name)
    }

    fn meta(&self) -> ResourceMeta {
        self.meta.clone()
    }

    fn validate(&self) -> Result<(), ResourceError> {
        if self.cmd.trim().is_empty() {
            return Err(ResourceError::Validation(format!(
                "{}: empty command",
                self.id()
            )));
        }
        Ok(())
    }

    async fn check_apply(&self, apply: bool) -> Result<bool, ResourceError> {
        let needs_run = match &self.if_cmd {
            Some(probe) => Self::run_shell(probe).await?.success(),
            None => !self.ran.load(Ordering::Relaxed),
        };
        if !needs_run {
            return Ok(true);
        }
        if apply {
            debug!(id = %self.id(), "running command");
            let status = Self::run_shell(&self.cmd).await?;
            if !status.success() {
                return Err(ResourceError::Apply(format!(
                    "{}: command exited with {status}",
                    self.id()
                )));
            }
            self.ran.store(true, Ordering::Relaxed);
        }
        Ok(false)
    }

    fn compare(&self, other: &dyn Resource) -> bool {
        other.as_any().downcast_ref::<Self>().is_some_and(|o| {
            o.name == self.name
                && o.cmd == self.cmd
                && o.if_cmd == self.if_cmd
                && o.meta == self.meta
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
