//! Process-wide record of which descriptor identities ran module init.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::Mutex;

type TeardownHook = Box<dyn FnOnce() + Send>;

struct ModuleRegistry {
    modules: Mutex<HashMap<String, Arc<Mutex<bool>>>>,
    teardown: Mutex<Vec<(String, TeardownHook)>>,
}

impl ModuleRegistry {
    fn new() -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
            teardown: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, identity: &str) -> Arc<Mutex<bool>> {
        let mut modules = self.modules.lock();
        Arc::clone(
            modules
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(false))),
        )
    }
}

static GLOBAL_REGISTRY: OnceLock<ModuleRegistry> = OnceLock::new();

fn registry() -> &'static ModuleRegistry {
    GLOBAL_REGISTRY.get_or_init(ModuleRegistry::new)
}

/// Runs `init` unless module init for `identity` already succeeded in this
/// process. Returns whether `init` ran.
///
/// Concurrent callers for one identity serialize; a failed init is not
/// recorded, so the next caller tries again.
pub fn ensure_module_initialized<E, F>(identity: &str, init: F) -> Result<bool, E>
where
    F: FnOnce() -> Result<(), E>,
{
    let slot = registry().slot(identity);
    let mut done = slot.lock();
    if *done {
        return Ok(false);
    }
    init()?;
    *done = true;
    debug!("module init for `{identity}` completed");
    Ok(true)
}

pub fn is_module_initialized(identity: &str) -> bool {
    let slot = registry().modules.lock().get(identity).cloned();
    slot.map(|slot| *slot.lock()).unwrap_or(false)
}

/// Registers a hook run by [`teardown_module_registry`].
pub fn register_module_teardown<F>(identity: &str, hook: F)
where
    F: FnOnce() + Send + 'static,
{
    registry()
        .teardown
        .lock()
        .push((identity.to_string(), Box::new(hook)));
}

/// Runs teardown hooks in reverse registration order and forgets every
/// initialized identity.
pub fn teardown_module_registry() -> usize {
    let registry = registry();
    let hooks = std::mem::take(&mut *registry.teardown.lock());
    let count = hooks.len();
    for (identity, hook) in hooks.into_iter().rev() {
        debug!("tearing down module `{identity}`");
        hook();
    }
    registry.modules.lock().clear();
    count
}
