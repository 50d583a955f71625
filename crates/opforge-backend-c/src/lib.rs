//! C toolchain for opforge units.
//!
//! Units are compiled with the system C compiler into shared libraries under
//! the cache directory and loaded with `libloading`. A loaded [`CArtifact`]
//! hands out [`Thunk`]s, each owning one `opforge_state`.

mod compiler;
mod config;
mod runtime;

pub use compiler::CToolchain;
pub use config::{CToolchainConfig, COMPILER, C_OPT_LEVEL};
pub use runtime::{CArtifact, ScalarValue, Thunk};

use std::sync::Arc;

use opforge::{assemble, ApplicationNode, CacheConfig, CompileCache, ForgeResult};

pub type CCompileCache = CompileCache<CToolchain>;

/// A compile cache backed by the C toolchain, both configured from the
/// environment.
pub fn compile_cache_from_env() -> CCompileCache {
    CompileCache::with_config(CToolchain::from_env(), CacheConfig::from_env())
}

/// Assembles `nodes`, acquires the unit and runs a fresh thunk once.
///
/// The handle is released before returning, whether or not the run failed.
pub fn execute(
    cache: &CCompileCache,
    nodes: &[ApplicationNode],
    inputs: &[ScalarValue],
) -> ForgeResult<Vec<ScalarValue>> {
    let unit = assemble(nodes)?;
    let handle = cache.acquire(&unit)?;
    let result = Arc::clone(handle.artifact())
        .instantiate()
        .and_then(|mut thunk| {
            let mut outputs = thunk.output_buffers()?;
            thunk.run(inputs, &mut outputs)?;
            Ok(outputs)
        });
    cache.release(handle);
    Ok(result?)
}
