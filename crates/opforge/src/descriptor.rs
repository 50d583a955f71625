//! Operation descriptors and their applications in a graph.
//!
//! A descriptor is a capability set: every fragment-producing method has a
//! neutral default, so an implementation only overrides what it contributes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Declared type of an input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotType {
    pub name: String,
    /// C type used to declare variables bound to this slot.
    pub c_type: String,
}

impl SlotType {
    pub fn new(name: impl Into<String>, c_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            c_type: c_type.into(),
        }
    }
}

/// One element of a cache version tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionScalar {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl VersionScalar {
    pub(crate) fn encode(&self) -> String {
        match self {
            VersionScalar::Int(value) => format!("i:{value}"),
            VersionScalar::Str(value) => format!("s:{value}"),
            VersionScalar::Bool(value) => format!("b:{value}"),
        }
    }
}

impl From<i64> for VersionScalar {
    fn from(value: i64) -> Self {
        VersionScalar::Int(value)
    }
}

impl From<i32> for VersionScalar {
    fn from(value: i32) -> Self {
        VersionScalar::Int(i64::from(value))
    }
}

impl From<&str> for VersionScalar {
    fn from(value: &str) -> Self {
        VersionScalar::Str(value.to_string())
    }
}

impl From<bool> for VersionScalar {
    fn from(value: bool) -> Self {
        VersionScalar::Bool(value)
    }
}

/// Builds a version tuple from mixed scalars: `version![1, "fast", true]`.
#[macro_export]
macro_rules! version {
    () => { ::std::vec::Vec::<$crate::VersionScalar>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::VersionScalar::from($value)),+]
    };
}

/// An opaque runtime context value requested by an application.
///
/// `init` is a C expression evaluated once when the thunk state is created;
/// the result is stored in a state member of the descriptor's declared
/// context type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextValue {
    pub init: String,
}

impl ContextValue {
    pub fn new(init: impl Into<String>) -> Self {
        Self { init: init.into() }
    }
}

/// Names a fragment may use to report failure and reach shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    /// Statement to execute after `opforge_set_error`; jumps to the cleanup
    /// ladder of the current scope.
    pub fail: String,
    /// Name of the `opforge_error*` in scope.
    pub error: String,
    /// Name of the `opforge_state*` in scope. Module init and per-application
    /// init run before any thunk state exists.
    pub state: Option<String>,
    /// Expression reaching this application's runtime context, if requested.
    pub context: Option<String>,
}

pub trait OperationDescriptor: Send + Sync {
    fn name(&self) -> &str;

    /// Key under which global support code and module init code are shared.
    fn identity(&self) -> String {
        self.name().to_string()
    }

    fn input_types(&self) -> Vec<SlotType>;

    fn output_types(&self) -> Vec<SlotType>;

    /// Code computing the outputs. It must store into the output variables
    /// and signal failure through `ctx.fail`, never with `return`.
    fn computation_code(
        &self,
        node: &ApplicationNode,
        instance: &str,
        inputs: &[String],
        outputs: &[String],
        ctx: &FailureContext,
    ) -> String;

    fn cleanup_code(
        &self,
        _node: &ApplicationNode,
        _instance: &str,
        _inputs: &[String],
        _outputs: &[String],
        _ctx: &FailureContext,
    ) -> String {
        String::new()
    }

    fn headers(&self) -> Vec<String> {
        Vec::new()
    }

    fn header_dirs(&self) -> Vec<String> {
        Vec::new()
    }

    fn libraries(&self) -> Vec<String> {
        Vec::new()
    }

    fn lib_dirs(&self) -> Vec<String> {
        Vec::new()
    }

    fn compile_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn forbidden_compile_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs once per process for this descriptor identity.
    fn module_init_code(&self, _ctx: &FailureContext) -> String {
        String::new()
    }

    /// Runs once per application when the unit is loaded.
    fn init_code_apply(
        &self,
        _node: &ApplicationNode,
        _instance: &str,
        _ctx: &FailureContext,
    ) -> String {
        String::new()
    }

    /// Member declarations added to the thunk state struct.
    fn struct_support_code(&self, _node: &ApplicationNode, _instance: &str) -> String {
        String::new()
    }

    fn struct_init_code(
        &self,
        _node: &ApplicationNode,
        _instance: &str,
        _ctx: &FailureContext,
    ) -> String {
        String::new()
    }

    fn struct_cleanup_code(
        &self,
        _node: &ApplicationNode,
        _instance: &str,
        _ctx: &FailureContext,
    ) -> String {
        String::new()
    }

    fn support_code(&self) -> String {
        String::new()
    }

    fn support_code_apply(&self, _node: &ApplicationNode, _instance: &str) -> String {
        String::new()
    }

    fn runtime_context(&self, _node: &ApplicationNode) -> Option<ContextValue> {
        None
    }

    /// C type of the value returned by `runtime_context`.
    fn context_type(&self) -> Option<String> {
        None
    }

    /// An empty tuple disables caching for every unit this descriptor is in.
    fn cache_version(&self) -> Vec<VersionScalar> {
        Vec::new()
    }

    fn cache_version_apply(&self, _node: &ApplicationNode) -> Vec<VersionScalar> {
        self.cache_version()
    }

    /// When true the application is left out of native code generation
    /// during constant folding.
    fn skip_native_during_constant_folding(&self, _node: &ApplicationNode) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Input(usize),
    Output(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotBinding {
    pub slot: Slot,
    pub variable: String,
}

/// One use of a descriptor on concrete variables.
#[derive(Clone)]
pub struct ApplicationNode {
    descriptor: Arc<dyn OperationDescriptor>,
    inputs: Vec<SlotBinding>,
    outputs: Vec<SlotBinding>,
}

impl ApplicationNode {
    pub fn new<I, O, S, T>(descriptor: Arc<dyn OperationDescriptor>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let inputs = inputs
            .into_iter()
            .enumerate()
            .map(|(idx, variable)| SlotBinding {
                slot: Slot::Input(idx),
                variable: variable.into(),
            })
            .collect();
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(idx, variable)| SlotBinding {
                slot: Slot::Output(idx),
                variable: variable.into(),
            })
            .collect();
        Self {
            descriptor,
            inputs,
            outputs,
        }
    }

    pub fn descriptor(&self) -> &Arc<dyn OperationDescriptor> {
        &self.descriptor
    }

    pub fn inputs(&self) -> &[SlotBinding] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SlotBinding] {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|b| b.variable.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|b| b.variable.clone()).collect()
    }
}

impl fmt::Debug for ApplicationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationNode")
            .field("descriptor", &self.descriptor.name())
            .field("inputs", &self.input_names())
            .field("outputs", &self.output_names())
            .finish()
    }
}
