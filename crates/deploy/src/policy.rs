use std::sync::Arc;

use kuberes_core::AppRecord;

/// Post-create callback. Runs synchronously on the deploying task.
pub type PatchFn = dyn Fn(&AppRecord) -> anyhow::Result<()> + Send + Sync;

/// Per-worker ownership policy, fixed at construction.
#[derive(Clone, Default)]
pub struct ExtensionPolicy {
    force: bool,
    patcher: Option<Arc<PatchFn>>,
}

impl ExtensionPolicy {
    /// `force`: when the name is live in another namespace of the cluster, delete the old
    /// application instead of failing with a conflict.
    pub fn new(force: bool) -> Self {
        Self { force, patcher: None }
    }

    pub fn with_patcher<F>(mut self, f: F) -> Self
    where
        F: Fn(&AppRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.patcher = Some(Arc::new(f));
        self
    }

    pub fn force(&self) -> bool { self.force }

    pub fn patcher(&self) -> Option<&PatchFn> { self.patcher.as_deref() }
}

impl std::fmt::Debug for ExtensionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPolicy")
            .field("force", &self.force)
            .field("patcher", &self.patcher.is_some())
            .finish()
    }
}
