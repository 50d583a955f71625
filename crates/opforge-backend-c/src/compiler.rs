use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};
use opforge::hashing::KeyHasher;
use opforge::{
    BuildRequirements, CacheKey, CompilationError, CompiledUnit, Toolchain, VariableDecl,
    VersionEntry,
};
use serde::Serialize;

use crate::config::{lib_ext, link_args, CToolchainConfig};
use crate::runtime::CArtifact;

/// Compiles units with a C compiler into shared libraries.
#[derive(Debug, Clone)]
pub struct CToolchain {
    config: CToolchainConfig,
}

impl CToolchain {
    pub fn new(config: CToolchainConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(CToolchainConfig::from_env())
    }

    pub fn config(&self) -> &CToolchainConfig {
        &self.config
    }

    /// Whether the configured compiler can be executed.
    pub fn is_available(&self) -> bool {
        Command::new(&self.config.compiler)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// File stem shared by the artifacts of `unit`.
    ///
    /// The unit key is suffixed with a digest of the compiler and the default
    /// flags that survive the unit's veto.
    pub fn artifact_stem(&self, unit: &CompiledUnit) -> String {
        let defaults = self.config.default_args();
        let mut hasher = KeyHasher::new();
        hasher.write_str(&self.config.compiler);
        hasher.write_strs(unit.requirements.filter_defaults(&defaults));
        format!("{}_{}", unit.key.to_hex(), hasher.finish().short())
    }

    pub fn source_path(&self, unit: &CompiledUnit) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("unit_{}.c", self.artifact_stem(unit)))
    }

    pub fn library_path(&self, unit: &CompiledUnit) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("libopforge_{}.{}", self.artifact_stem(unit), lib_ext()))
    }

    pub fn manifest_path(&self, unit: &CompiledUnit) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("unit_{}.json", self.artifact_stem(unit)))
    }

    /// Arguments passed to the compiler, program name excluded.
    pub fn compile_args(&self, unit: &CompiledUnit, src: &Path, out: &Path) -> Vec<OsString> {
        let reqs = &unit.requirements;
        let mut args: Vec<OsString> = link_args()
            .iter()
            .map(|arg| OsString::from(*arg))
            .collect();
        let defaults = self.config.default_args();
        args.extend(reqs.filter_defaults(&defaults).into_iter().map(OsString::from));
        args.extend(reqs.header_dirs.iter().map(|dir| OsString::from(format!("-I{dir}"))));
        args.extend(reqs.compile_args.iter().map(OsString::from));
        args.push(OsString::from("-o"));
        args.push(out.as_os_str().to_os_string());
        args.push(src.as_os_str().to_os_string());
        args.extend(reqs.lib_dirs.iter().map(|dir| OsString::from(format!("-L{dir}"))));
        args.extend(reqs.libraries.iter().map(|lib| OsString::from(format!("-l{lib}"))));
        args
    }

    fn build_library(
        &self,
        unit: &CompiledUnit,
        src: &Path,
        out: &Path,
    ) -> Result<(), CompilationError> {
        fs::write(src, &unit.source).map_err(|err| {
            CompilationError::new(
                unit.key,
                format!("failed to write {}: {err}", src.display()),
            )
        })?;

        let args = self.compile_args(unit, src, out);
        debug!(
            "{} {}",
            self.config.compiler,
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let output = Command::new(&self.config.compiler)
            .args(&args)
            .output()
            .map_err(|err| {
                CompilationError::new(
                    unit.key,
                    format!("failed to run {}: {err}", self.config.compiler),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(CompilationError::new(
                unit.key,
                format!(
                    "{} exited with {}: stdout='{}' stderr='{}'",
                    self.config.compiler,
                    output.status,
                    stdout.trim(),
                    stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    fn compile_cached(&self, unit: &CompiledUnit) -> Result<CArtifact, CompilationError> {
        let io_err = |what: &str, path: &Path, err: std::io::Error| {
            CompilationError::new(
                unit.key,
                format!("failed to {what} {}: {err}", path.display()),
            )
        };
        let cache_dir = &self.config.cache_dir;
        fs::create_dir_all(cache_dir)
            .map_err(|err| io_err("create", cache_dir.as_path(), err))?;

        let lib_path = self.library_path(unit);
        if lib_path.exists() {
            debug!("reusing {}", lib_path.display());
            return CArtifact::load(unit, &lib_path, None);
        }

        // Build in a private staging dir so that concurrent builders, in this
        // process or another, never observe a partially written file.
        let staging = tempfile::Builder::new()
            .prefix(".opforge_stage_")
            .tempdir_in(cache_dir)
            .map_err(|err| io_err("stage in", cache_dir.as_path(), err))?;
        let staged_src = staging.path().join("unit.c");
        let staged_lib = staging.path().join(format!("libopforge.{}", lib_ext()));
        let staged_manifest = staging.path().join("unit.json");
        self.build_library(unit, &staged_src, &staged_lib)?;

        let manifest = UnitManifest::new(unit, self);
        let json = serde_json::to_string_pretty(&manifest).map_err(|err| {
            CompilationError::new(unit.key, format!("failed to encode manifest: {err}"))
        })?;
        fs::write(&staged_manifest, json)
            .map_err(|err| io_err("write", staged_manifest.as_path(), err))?;

        // The library goes last: its presence marks the entry as complete.
        publish(&staged_src, &self.source_path(unit))
            .map_err(|(path, err)| io_err("publish", path.as_path(), err))?;
        publish(&staged_manifest, &self.manifest_path(unit))
            .map_err(|(path, err)| io_err("publish", path.as_path(), err))?;
        publish(&staged_lib, &lib_path)
            .map_err(|(path, err)| io_err("publish", path.as_path(), err))?;

        CArtifact::load(unit, &lib_path, None)
    }

    fn compile_scratch(&self, unit: &CompiledUnit) -> Result<CArtifact, CompilationError> {
        let scratch = tempfile::Builder::new()
            .prefix("opforge_")
            .tempdir()
            .map_err(|err| {
                CompilationError::new(unit.key, format!("failed to create scratch dir: {err}"))
            })?;
        let hex = unit.key.to_hex();
        let src_path = scratch.path().join(format!("unit_{hex}.c"));
        let lib_path = scratch
            .path()
            .join(format!("libopforge_{hex}.{}", lib_ext()));
        self.build_library(unit, &src_path, &lib_path)?;

        if self.config.keep_sources {
            let kept = self.source_path(unit);
            let copied = fs::create_dir_all(&self.config.cache_dir)
                .and_then(|_| fs::copy(&src_path, &kept));
            if let Err(err) = copied {
                debug!("could not keep {}: {err}", kept.display());
            }
        }
        CArtifact::load(unit, &lib_path, Some(scratch))
    }
}

/// Moves a staged file into place. A destination that another builder has
/// already published is kept.
fn publish(staged: &Path, dest: &Path) -> Result<(), (PathBuf, std::io::Error)> {
    match fs::rename(staged, dest) {
        Ok(()) => Ok(()),
        Err(_) if dest.exists() => Ok(()),
        Err(err) => Err((dest.to_path_buf(), err)),
    }
}

impl Default for CToolchain {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Toolchain for CToolchain {
    type Artifact = CArtifact;

    fn name(&self) -> &str {
        &self.config.compiler
    }

    fn compile(&self, unit: &CompiledUnit) -> Result<CArtifact, CompilationError> {
        if unit.cacheable {
            self.compile_cached(unit)
        } else {
            info!(
                "unit {} is not cacheable; building in a scratch directory",
                unit.key.short()
            );
            self.compile_scratch(unit)
        }
    }
}

/// JSON sidecar written next to each cached library.
#[derive(Debug, Serialize)]
struct UnitManifest<'a> {
    key: CacheKey,
    compiler: &'a str,
    args: Vec<String>,
    instances: &'a [String],
    inputs: &'a [VariableDecl],
    outputs: &'a [VariableDecl],
    module_inits: &'a [String],
    requirements: &'a BuildRequirements,
    versions: &'a [VersionEntry],
}

impl<'a> UnitManifest<'a> {
    fn new(unit: &'a CompiledUnit, toolchain: &'a CToolchain) -> Self {
        Self {
            key: unit.key,
            compiler: &toolchain.config.compiler,
            args: unit
                .requirements
                .filter_defaults(&toolchain.config.default_args())
                .into_iter()
                .map(str::to_string)
                .collect(),
            instances: &unit.instances,
            inputs: &unit.inputs,
            outputs: &unit.outputs,
            module_inits: &unit.module_inits,
            requirements: &unit.requirements,
            versions: &unit.versions,
        }
    }
}
