//! Loaded unit libraries and the thunks instantiated from them.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use log::debug;
use opforge::registry::ensure_module_initialized;
use opforge::{CacheKey, CompilationError, CompiledUnit, RuntimeComputationFailure, VariableDecl};
use tempfile::TempDir;

const ERROR_MESSAGE_LEN: usize = 512;

/// Mirror of the generated `opforge_error` struct.
#[repr(C)]
struct CError {
    code: c_int,
    message: [c_char; ERROR_MESSAGE_LEN],
}

impl CError {
    fn new() -> Self {
        Self {
            code: 0,
            message: [0; ERROR_MESSAGE_LEN],
        }
    }

    fn message(&self) -> String {
        let bytes: Vec<u8> = self
            .message
            .iter()
            .take_while(|&&ch| ch != 0)
            .map(|&ch| ch as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn into_failure(self, status: c_int, fallback: &str) -> RuntimeComputationFailure {
        let code = if self.code != 0 { self.code } else { status };
        let message = self.message();
        if message.is_empty() {
            RuntimeComputationFailure::new(code, fallback)
        } else {
            RuntimeComputationFailure::new(code, message)
        }
    }
}

type InitFn = unsafe extern "C" fn(*mut CError) -> c_int;
type StateNewFn = unsafe extern "C" fn(*mut CError) -> *mut c_void;
type StateFreeFn = unsafe extern "C" fn(*mut c_void);
type RunFn =
    unsafe extern "C" fn(*mut c_void, *const *mut c_void, *const *mut c_void, *mut CError) -> c_int;
type CountFn = unsafe extern "C" fn() -> usize;
type IdentityFn = unsafe extern "C" fn(usize) -> *const c_char;

struct ModuleInit {
    identity: String,
    init: InitFn,
}

/// A compiled unit loaded into the process.
pub struct CArtifact {
    key: CacheKey,
    path: PathBuf,
    inputs: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    module_inits: Vec<ModuleInit>,
    unit_init: InitFn,
    state_new: StateNewFn,
    state_free: StateFreeFn,
    run: RunFn,
    // Dropped before `_scratch` so the library is unloaded before its
    // directory goes away.
    _lib: Library,
    _scratch: Option<TempDir>,
}

impl CArtifact {
    pub(crate) fn load(
        unit: &CompiledUnit,
        path: &Path,
        scratch: Option<TempDir>,
    ) -> Result<Self, CompilationError> {
        let load_err = |what: &str, err: libloading::Error| {
            CompilationError::new(
                unit.key,
                format!("failed to load {what} from {}: {err}", path.display()),
            )
        };

        let lib = unsafe { Library::new(path) }.map_err(|err| load_err("library", err))?;
        let unit_init = unsafe { lib.get::<InitFn>(b"opforge_unit_init").map(|sym| *sym) }
            .map_err(|err| load_err("opforge_unit_init", err))?;
        let state_new = unsafe { lib.get::<StateNewFn>(b"opforge_state_new").map(|sym| *sym) }
            .map_err(|err| load_err("opforge_state_new", err))?;
        let state_free = unsafe { lib.get::<StateFreeFn>(b"opforge_state_free").map(|sym| *sym) }
            .map_err(|err| load_err("opforge_state_free", err))?;
        let run = unsafe { lib.get::<RunFn>(b"opforge_run").map(|sym| *sym) }
            .map_err(|err| load_err("opforge_run", err))?;
        let module_count = unsafe { lib.get::<CountFn>(b"opforge_module_count").map(|sym| *sym) }
            .map_err(|err| load_err("opforge_module_count", err))?;
        let module_identity =
            unsafe { lib.get::<IdentityFn>(b"opforge_module_identity").map(|sym| *sym) }
                .map_err(|err| load_err("opforge_module_identity", err))?;

        let count = unsafe { module_count() };
        let mut module_inits = Vec::with_capacity(count);
        for idx in 0..count {
            let ptr = unsafe { module_identity(idx) };
            if ptr.is_null() {
                return Err(CompilationError::new(
                    unit.key,
                    format!("module identity {idx} missing from {}", path.display()),
                ));
            }
            let identity = unsafe { CStr::from_ptr(ptr) }
                .to_string_lossy()
                .into_owned();
            let symbol = format!("opforge_module_init_{idx}");
            let init = unsafe { lib.get::<InitFn>(symbol.as_bytes()).map(|sym| *sym) }
                .map_err(|err| load_err(&symbol, err))?;
            module_inits.push(ModuleInit { identity, init });
        }

        debug!(
            "loaded unit {} from {} ({} module init(s))",
            unit.key.short(),
            path.display(),
            module_inits.len()
        );
        Ok(Self {
            key: unit.key,
            path: path.to_path_buf(),
            inputs: unit.inputs.clone(),
            outputs: unit.outputs.clone(),
            module_inits,
            unit_init,
            state_new,
            state_free,
            run,
            _lib: lib,
            _scratch: scratch,
        })
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }

    /// Runs pending module inits, the unit init and allocates a thunk state.
    pub fn instantiate(self: Arc<Self>) -> Result<Thunk, RuntimeComputationFailure> {
        for module in &self.module_inits {
            let init = module.init;
            ensure_module_initialized(&module.identity, || {
                let mut err = CError::new();
                let status = unsafe { init(&mut err) };
                if status == 0 {
                    Ok(())
                } else {
                    Err(err.into_failure(status, "module init failed"))
                }
            })?;
        }

        let mut err = CError::new();
        let status = unsafe { (self.unit_init)(&mut err) };
        if status != 0 {
            return Err(err.into_failure(status, "unit init failed"));
        }

        let mut err = CError::new();
        let state = unsafe { (self.state_new)(&mut err) };
        if state.is_null() {
            return Err(err.into_failure(-1, "thunk state initialization failed"));
        }
        Ok(Thunk {
            artifact: self,
            state,
        })
    }
}

/// A runnable instance of a unit with its own state.
pub struct Thunk {
    artifact: Arc<CArtifact>,
    state: *mut c_void,
}

// The state is owned by this thunk and only touched through `&mut self`.
unsafe impl Send for Thunk {}

impl Thunk {
    pub fn artifact(&self) -> &Arc<CArtifact> {
        &self.artifact
    }

    /// Zeroed output values matching the unit's declared output types.
    pub fn output_buffers(&self) -> Result<Vec<ScalarValue>, RuntimeComputationFailure> {
        self.artifact
            .outputs
            .iter()
            .map(|decl| {
                ScalarValue::zeroed(&decl.c_type).ok_or_else(|| {
                    invalid_args(format!(
                        "output `{}` has C type `{}` with no scalar mapping",
                        decl.name, decl.c_type
                    ))
                })
            })
            .collect()
    }

    /// Runs the unit on typed scalars; `outputs` is overwritten in place.
    pub fn run(
        &mut self,
        inputs: &[ScalarValue],
        outputs: &mut [ScalarValue],
    ) -> Result<(), RuntimeComputationFailure> {
        check_values("input", &self.artifact.inputs, inputs)?;
        check_values("output", &self.artifact.outputs, outputs)?;
        let input_ptrs: Vec<*mut c_void> = inputs.iter().map(ScalarValue::as_ptr).collect();
        let output_ptrs: Vec<*mut c_void> =
            outputs.iter_mut().map(ScalarValue::as_mut_ptr).collect();
        unsafe { self.run_raw(&input_ptrs, &output_ptrs) }
    }

    /// Runs the unit on caller-managed storage.
    ///
    /// # Safety
    ///
    /// `inputs[i]` must point to a readable value of the C type of input
    /// `i`, and `outputs[j]` to writable storage for output `j`.
    pub unsafe fn run_raw(
        &mut self,
        inputs: &[*mut c_void],
        outputs: &[*mut c_void],
    ) -> Result<(), RuntimeComputationFailure> {
        let artifact = &self.artifact;
        if inputs.len() != artifact.inputs.len() || outputs.len() != artifact.outputs.len() {
            return Err(invalid_args(format!(
                "expected {} input(s) and {} output(s), got {} and {}",
                artifact.inputs.len(),
                artifact.outputs.len(),
                inputs.len(),
                outputs.len()
            )));
        }
        let mut err = CError::new();
        let status = (artifact.run)(self.state, inputs.as_ptr(), outputs.as_ptr(), &mut err);
        if status != 0 {
            return Err(err.into_failure(status, "computation failed"));
        }
        Ok(())
    }
}

impl Drop for Thunk {
    fn drop(&mut self) {
        if self.state.is_null() {
            return;
        }
        unsafe { (self.artifact.state_free)(self.state) };
        self.state = std::ptr::null_mut();
    }
}

fn invalid_args(message: String) -> RuntimeComputationFailure {
    RuntimeComputationFailure::new(-2, message)
}

fn check_values(
    role: &str,
    decls: &[VariableDecl],
    values: &[ScalarValue],
) -> Result<(), RuntimeComputationFailure> {
    if decls.len() != values.len() {
        return Err(invalid_args(format!(
            "expected {} {role}(s), got {}",
            decls.len(),
            values.len()
        )));
    }
    for (decl, value) in decls.iter().zip(values) {
        if !value.matches(&decl.c_type) {
            return Err(invalid_args(format!(
                "{role} `{}` is `{}` but a `{}` value was supplied",
                decl.name,
                decl.c_type,
                value.c_type()
            )));
        }
    }
    Ok(())
}

/// A scalar passed by pointer to or from a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    U8(u8),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn c_type(&self) -> &'static str {
        match self {
            ScalarValue::U8(_) => "uint8_t",
            ScalarValue::I32(_) => "int32_t",
            ScalarValue::I64(_) => "int64_t",
            ScalarValue::U32(_) => "uint32_t",
            ScalarValue::U64(_) => "uint64_t",
            ScalarValue::F32(_) => "float",
            ScalarValue::F64(_) => "double",
        }
    }

    /// Whether this value can be bound to a slot declared as `c_type`.
    pub fn matches(&self, c_type: &str) -> bool {
        Self::zeroed(c_type).is_some_and(|zero| zero.c_type() == self.c_type())
    }

    pub fn zeroed(c_type: &str) -> Option<Self> {
        Some(match c_type {
            "uint8_t" => ScalarValue::U8(0),
            "int32_t" | "int" => ScalarValue::I32(0),
            "int64_t" => ScalarValue::I64(0),
            "uint32_t" => ScalarValue::U32(0),
            "uint64_t" => ScalarValue::U64(0),
            "float" => ScalarValue::F32(0.0),
            "double" => ScalarValue::F64(0.0),
            _ => return None,
        })
    }

    fn as_ptr(&self) -> *mut c_void {
        match self {
            ScalarValue::U8(value) => value as *const u8 as *mut c_void,
            ScalarValue::I32(value) => value as *const i32 as *mut c_void,
            ScalarValue::I64(value) => value as *const i64 as *mut c_void,
            ScalarValue::U32(value) => value as *const u32 as *mut c_void,
            ScalarValue::U64(value) => value as *const u64 as *mut c_void,
            ScalarValue::F32(value) => value as *const f32 as *mut c_void,
            ScalarValue::F64(value) => value as *const f64 as *mut c_void,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        match self {
            ScalarValue::U8(value) => value as *mut u8 as *mut c_void,
            ScalarValue::I32(value) => value as *mut i32 as *mut c_void,
            ScalarValue::I64(value) => value as *mut i64 as *mut c_void,
            ScalarValue::U32(value) => value as *mut u32 as *mut c_void,
            ScalarValue::U64(value) => value as *mut u64 as *mut c_void,
            ScalarValue::F32(value) => value as *mut f32 as *mut c_void,
            ScalarValue::F64(value) => value as *mut f64 as *mut c_void,
        }
    }
}
