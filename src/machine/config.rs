//! Construction-time options for a [`Machine`](super::vm::Machine).

use super::natives::{DebugHook, NativeCallback};
use super::overlay::OverlayLoader;
use super::vm::executor::{Executor, SwitchExecutor, ThreadedExecutor};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which interpreter body runs the code.
#[derive(Clone, Default)]
pub enum ExecutorKind {
    /// One `match` per instruction.
    #[default]
    Switch,
    /// A handler table indexed by opcode.
    Threaded,
    /// A host-supplied executor.
    Custom(Arc<dyn Executor>),
}

impl ExecutorKind {
    /// Instantiates the executor.
    pub fn build(&self) -> Arc<dyn Executor> {
        match self {
            ExecutorKind::Switch => Arc::new(SwitchExecutor),
            ExecutorKind::Threaded => Arc::new(ThreadedExecutor::new()),
            ExecutorKind::Custom(executor) => executor.clone(),
        }
    }
}

impl fmt::Debug for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::Switch => write!(f, "Switch"),
            ExecutorKind::Threaded => write!(f, "Threaded"),
            ExecutorKind::Custom(executor) => write!(f, "Custom({})", executor.name()),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "switch" => Ok(ExecutorKind::Switch),
            "threaded" => Ok(ExecutorKind::Threaded),
            other => Err(format!("unknown executor '{other}' (expected 'switch' or 'threaded')")),
        }
    }
}

/// Options for [`Machine::load_with`](super::vm::Machine::load_with).
#[derive(Clone, Default)]
pub struct MachineConfig {
    pub executor: ExecutorKind,
    /// Rewrite native call sites to direct calls after their first dispatch.
    pub direct_patch: bool,
    pub overlay_loader: Option<Arc<dyn OverlayLoader>>,
    /// Replaces the default native dispatch.
    pub callback: Option<Arc<dyn NativeCallback>>,
    pub debug_hook: Option<Arc<dyn DebugHook>>,
}

impl fmt::Debug for MachineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineConfig")
            .field("executor", &self.executor)
            .field("direct_patch", &self.direct_patch)
            .field("overlay_loader", &self.overlay_loader.is_some())
            .field("callback", &self.callback.is_some())
            .field("debug_hook", &self.debug_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_kind_parsing() {
        assert!(matches!("switch".parse::<ExecutorKind>(), Ok(ExecutorKind::Switch)));
        assert!(matches!("Threaded".parse::<ExecutorKind>(), Ok(ExecutorKind::Threaded)));
        assert!("jit".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn default_config() {
        let config = MachineConfig::default();
        assert!(!config.direct_patch);
        assert!(matches!(config.executor, ExecutorKind::Switch));
        assert_eq!(config.executor.build().name(), "switch");
        assert_eq!(ExecutorKind::Threaded.build().name(), "threaded");
    }
}
