//! Lifecycle hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgshift_core::{BoxError, Error, Result};
use tracing::debug;

use crate::roll::Roll;

/// Points in the lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// After validation, before the start DDL.
    BeforeStartDdl,
    /// After the start DDL, before the version schema is created.
    AfterStartDdl,
    /// Before the complete DDL.
    BeforeCompleteDdl,
    /// After the complete DDL, before the migration is marked done.
    AfterCompleteDdl,
}

impl HookPhase {
    /// Name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeStartDdl => "before_start_ddl",
            HookPhase::AfterStartDdl => "after_start_ddl",
            HookPhase::BeforeCompleteDdl => "before_complete_ddl",
            HookPhase::AfterCompleteDdl => "after_complete_ddl",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback run at a [`HookPhase`]. An error aborts the phase.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    /// Run the hook.
    async fn call(&self, roll: &Roll) -> std::result::Result<(), BoxError>;
}

/// Hooks keyed by phase, run in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: HashMap<HookPhase, Vec<Arc<dyn MigrationHook>>>,
}

impl Hooks {
    /// Create an empty hook map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for `phase`.
    pub fn register(&mut self, phase: HookPhase, hook: Arc<dyn MigrationHook>) {
        self.hooks.entry(phase).or_default().push(hook);
    }

    /// Number of hooks registered for `phase`.
    pub fn len(&self, phase: HookPhase) -> usize {
        self.hooks.get(&phase).map_or(0, Vec::len)
    }

    /// Whether no hooks are registered at all.
    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    /// Run the hooks for `phase`, stopping at the first failure.
    pub async fn run(&self, phase: HookPhase, roll: &Roll) -> Result<()> {
        let Some(hooks) = self.hooks.get(&phase) else {
            return Ok(());
        };
        for hook in hooks {
            debug!(phase = %phase, "running hook");
            hook.call(roll).await.map_err(|source| Error::Hook {
                phase: phase.as_str(),
                source,
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (phase, hooks) in &self.hooks {
            map.entry(phase, &hooks.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MigrationHook for Noop {
        async fn call(&self, _roll: &Roll) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_hooks() {
        let mut hooks = Hooks::new();
        assert!(hooks.is_empty());

        hooks.register(HookPhase::BeforeStartDdl, Arc::new(Noop));
        hooks.register(HookPhase::BeforeStartDdl, Arc::new(Noop));
        hooks.register(HookPhase::AfterCompleteDdl, Arc::new(Noop));

        assert!(!hooks.is_empty());
        assert_eq!(hooks.len(HookPhase::BeforeStartDdl), 2);
        assert_eq!(hooks.len(HookPhase::AfterStartDdl), 0);
        assert_eq!(hooks.len(HookPhase::AfterCompleteDdl), 1);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(HookPhase::BeforeStartDdl.to_string(), "before_start_ddl");
        assert_eq!(HookPhase::AfterCompleteDdl.as_str(), "after_complete_ddl");
    }
}
