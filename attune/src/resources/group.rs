use std::any::Any;

use async_trait::async_trait;
use tokio::task::JoinSet;

use super::{Resource, ResourceError, ResourceHandle, ResourceId, ResourceMeta, WatchContext};

/// A composite vertex produced by the auto-group pass.
///
/// The composite fans every capability over its members: one watch task per
/// member, serial `check_apply` in member order (preserving the engine's
/// one-in-flight guarantee per member), and member-wise identity for swap
/// matching. Members are kept sorted by name so composites built from the
/// same set are identical regardless of discovery order.
pub struct ResourceGroup {
    kind: String,
    name: String,
    members: Vec<ResourceHandle>,
}

impl ResourceGroup {
    /// Build a composite from at least two members of the same kind.
    pub fn new(mut members: Vec<ResourceHandle>) -> Self {
        debug_assert!(members.len() >= 2);
        members.sort_by(|a, b| a.id().cmp(&b.id()));
        let kind = members[0].id().kind;
        let name = members
            .iter()
            .map(|m| m.id().name)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            kind,
            name,
            members,
        }
    }

    pub fn members(&self) -> &[ResourceHandle] {
        &self.members
    }
}

#[async_trait]
impl Resource for ResourceGroup {
    fn id(&self) -> ResourceId {
        ResourceId::new(&self.kind, &self.name)
    }

    fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            noop: self.members.iter().all(|m| m.meta().noop),
            reverse: self.members.iter().any(|m| m.meta().reverse),
            autogroup: None,
        }
    }

    async fn init(&self) -> Result<(), ResourceError> {
        for member in &self.members {
            member.init().await?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ResourceError> {
        for member in &self.members {
            member.validate()?;
        }
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), ResourceError> {
        let mut set: JoinSet<Result<(), ResourceError>> = JoinSet::new();
        for member in &self.members {
            let member = member.clone();
            let member_ctx = WatchContext {
                signals: ctx.signals.clone(),
                cancel: ctx.cancel.clone(),
            };
            set.spawn(async move { member.watch(member_ctx).await });
        }
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                        ctx.cancel.cancel();
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(ResourceError::Watch(join_err.to_string()));
                        ctx.cancel.cancel();
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn check_apply(&self, apply: bool) -> Result<bool, ResourceError> {
        let mut all_ok = true;
        for member in &self.members {
            if !member.check_apply(apply).await? {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    fn compare(&self, other: &dyn Resource) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return false;
        };
        self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(other.members.iter())
                .all(|(a, b)| a.compare(b.as_ref()))
    }

    fn auto_edges(&self) -> Vec<ResourceId> {
        let mut deps = Vec::new();
        for member in &self.members {
            deps.extend(member.auto_edges());
        }
        deps
    }

    async fn close(&self) -> Result<(), ResourceError> {
        let mut first_err = None;
        for member in &self.members {
            if let Err(err) = member.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::NoopRes;
    use super::*;

    fn group(names: &[&str]) -> ResourceGroup {
        ResourceGroup::new(
            names
                .iter()
                .map(|n| Arc::new(NoopRes::new(*n)) as ResourceHandle)
                .collect(),
        )
    }

    #[test]
    fn name_is_sorted_member_join() {
        let g = group(&["b", "a"]);
        assert_eq!(g.id(), ResourceId::new("noop", "a,b"));
    }

    #[test]
    fn compare_is_member_wise() {
        assert!(group(&["a", "b"]).compare(&group(&["b", "a"])));
        assert!(!group(&["a", "b"]).compare(&group(&["a", "c"])));
        assert!(!group(&["a", "b"]).compare(&group(&["a", "b", "c"])));
    }

    #[tokio::test]
    async fn check_apply_ands_members() {
        let g = group(&["a", "b"]);
        assert!(g.check_apply(false).await.unwrap());
    }
}
