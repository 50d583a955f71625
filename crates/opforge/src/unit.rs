use serde::{Deserialize, Serialize};

use crate::collector::VariableDecl;
use crate::descriptor::VersionScalar;
use crate::hashing::{CacheKey, KeyHasher};

/// Build inputs merged across every application of a unit, in first-seen
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequirements {
    pub headers: Vec<String>,
    pub header_dirs: Vec<String>,
    pub libraries: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub compile_args: Vec<String>,
    /// Vetoed unit-wide; toolchains must drop these from their defaults too.
    pub forbidden_args: Vec<String>,
}

impl BuildRequirements {
    pub fn forbids(&self, arg: &str) -> bool {
        self.forbidden_args.iter().any(|forbidden| forbidden == arg)
    }

    /// Keeps the args of `defaults` that no application forbids.
    pub fn filter_defaults<'a>(&self, defaults: &'a [String]) -> Vec<&'a str> {
        defaults
            .iter()
            .map(String::as_str)
            .filter(|arg| !self.forbids(arg))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub instance: String,
    pub identity: String,
    pub version: Vec<VersionScalar>,
}

/// One assembled compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub key: CacheKey,
    pub cacheable: bool,
    pub source: String,
    pub requirements: BuildRequirements,
    pub versions: Vec<VersionEntry>,
    /// Variables the caller supplies, in first-use order.
    pub inputs: Vec<VariableDecl>,
    /// Variables produced inside the unit, in production order.
    pub outputs: Vec<VariableDecl>,
    /// Identities with module init code; entry `i` is exported as
    /// `opforge_module_init_<i>`.
    pub module_inits: Vec<String>,
    pub instances: Vec<String>,
    /// Applications left out because they opted out of native code during
    /// constant folding.
    pub folded: Vec<String>,
}

impl CompiledUnit {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|var| var.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|var| var.name == name)
    }
}

/// Units whose versions include an empty tuple are rebuilt on every acquire.
pub fn is_cacheable(versions: &[VersionEntry]) -> bool {
    versions.iter().all(|entry| !entry.version.is_empty())
}

/// Digest over the source, the order-normalized build requirements and the
/// version tuples of every application in application order.
pub fn compute_cache_key(
    source: &str,
    requirements: &BuildRequirements,
    versions: &[VersionEntry],
) -> CacheKey {
    let mut hasher = KeyHasher::new();
    hasher.write_tag(b'S');
    hasher.write_str(source);

    for (tag, values) in [
        (b'H', &requirements.headers),
        (b'I', &requirements.header_dirs),
        (b'l', &requirements.libraries),
        (b'L', &requirements.lib_dirs),
        (b'A', &requirements.compile_args),
        (b'F', &requirements.forbidden_args),
    ] {
        let mut normalized: Vec<&str> = values.iter().map(String::as_str).collect();
        normalized.sort_unstable();
        normalized.dedup();
        hasher.write_tag(tag);
        hasher.write_strs(normalized);
    }

    hasher.write_tag(b'V');
    hasher.write_u64(versions.len() as u64);
    for entry in versions {
        hasher.write_str(&entry.identity);
        let encoded: Vec<String> = entry.version.iter().map(VersionScalar::encode).collect();
        hasher.write_strs(encoded.iter().map(String::as_str));
    }
    hasher.finish()
}
