use std::any::Any;

use async_trait::async_trait;

use super::{Resource, ResourceError, ResourceId, ResourceMeta};

/// A resource that is always satisfied.
///
/// Useful as a synchronization point in a graph: it applies instantly and
/// passes pokes through to its successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoopRes {
    name: String,
    meta: ResourceMeta,
}

impl NoopRes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: ResourceMeta::default(),
        }
    }

    pub fn with_meta(name: impl Into<String>, meta: ResourceMeta) -> Self {
        Self {
            name: name.into(),
            meta,
        }
    }
}

#[async_trait]
impl Resource for NoopRes {
    fn id(&self) -> ResourceId {
        ResourceId::new("noop", &self.name)
    }

    fn meta(&self) -> ResourceMeta {
        self.meta.clone()
    }

    async fn check_apply(&self, _apply: bool) -> Result<bool, ResourceError> {
        Ok(true)
    }

    fn compare(&self, other: &dyn Resource) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_satisfied() {
        let res = NoopRes::new("sync");
        assert!(res.check_apply(true).await.unwrap());
        assert!(res.check_apply(false).await.unwrap());
    }

    #[test]
    fn compare_is_name_sensitive() {
        let a = NoopRes::new("a");
        let b = NoopRes::new("b");
        assert!(a.compare(&a.clone()));
        assert!(!a.compare(&b));
    }
}
