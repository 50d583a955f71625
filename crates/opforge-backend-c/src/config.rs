use std::path::PathBuf;

use opforge::env;

pub const COMPILER: &str = "CC";
pub const C_OPT_LEVEL: &str = "OPFORGE_C_OPT_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CToolchainConfig {
    pub compiler: String,
    /// Holds `unit_<key>.c`, `libopforge_<key>.<ext>` and the JSON sidecar.
    pub cache_dir: PathBuf,
    /// Passed as `-O<level>`.
    pub opt_level: String,
    /// Appended to the default args; subject to the unit's forbidden args.
    pub extra_args: Vec<String>,
    /// Also persist the sources of non-cacheable units in `cache_dir`.
    pub keep_sources: bool,
}

impl Default for CToolchainConfig {
    fn default() -> Self {
        Self {
            compiler: "cc".to_string(),
            cache_dir: std::env::temp_dir().join("opforge_cache"),
            opt_level: "2".to_string(),
            extra_args: Vec::new(),
            keep_sources: false,
        }
    }
}

impl CToolchainConfig {
    pub fn from_env() -> Self {
        Self {
            compiler: env::var(COMPILER).unwrap_or_else(|| "cc".to_string()),
            cache_dir: env::default_cache_dir(),
            opt_level: env::var(C_OPT_LEVEL).unwrap_or_else(|| "2".to_string()),
            extra_args: Vec::new(),
            keep_sources: env::var_bool(env::KEEP_SOURCES).unwrap_or(false),
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_opt_level(mut self, level: impl Into<String>) -> Self {
        self.opt_level = level.into();
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keep_sources(mut self, keep: bool) -> Self {
        self.keep_sources = keep;
        self
    }

    /// Args applied to every unit unless an application forbids them.
    pub fn default_args(&self) -> Vec<String> {
        let mut args = vec![format!("-O{}", self.opt_level)];
        if !cfg!(target_os = "windows") {
            args.push("-fno-math-errno".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Args needed to produce a loadable library; never filtered.
pub(crate) fn link_args() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["-dynamiclib"]
    } else {
        &["-shared", "-fPIC"]
    }
}

pub(crate) fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}
