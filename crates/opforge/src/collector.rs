//! Fragment collection for a single application.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ApplicationNode, FailureContext, SlotType, VersionScalar};
use crate::error::{AssembleError, AssembleResult};
use crate::render::{is_c_identifier, sanitize_symbol};

pub(crate) const ERROR_VAR: &str = "err";
pub(crate) const STATE_VAR: &str = "state";
pub(crate) const STATUS_VAR: &str = "opforge_status";

pub(crate) fn exec_cleanup_label(position: usize) -> String {
    format!("opforge_exec_cleanup_{position}")
}

pub(crate) fn init_fail_label(position: usize) -> String {
    format!("opforge_init_fail_{position}")
}

pub(crate) const UNIT_INIT_FAIL_LABEL: &str = "opforge_unit_init_fail";
pub(crate) const MODULE_INIT_FAIL_LABEL: &str = "opforge_module_init_fail";

/// A variable as it is declared in the generated unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub c_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    pub c_type: String,
    pub init: String,
    /// State member holding the value.
    pub member: String,
}

/// Everything one application contributes to a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentSet {
    pub position: usize,
    pub instance: String,
    pub identity: String,
    pub inputs: Vec<VariableDecl>,
    pub outputs: Vec<VariableDecl>,
    pub computation: String,
    pub cleanup: String,
    pub headers: Vec<String>,
    pub header_dirs: Vec<String>,
    pub libraries: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub compile_args: Vec<String>,
    pub forbidden_args: Vec<String>,
    pub module_init: String,
    pub init_apply: String,
    pub struct_support: String,
    pub struct_init: String,
    pub struct_cleanup: String,
    pub support: String,
    pub support_apply: String,
    pub context: Option<RuntimeContext>,
    pub version: Vec<VersionScalar>,
    pub skip_during_constant_folding: bool,
}

pub fn instance_name(node: &ApplicationNode, position: usize) -> String {
    let base = sanitize_symbol(node.descriptor().name());
    format!("{base}_{position}")
}

/// Collects the fragments of `node`, which sits at `position` in its unit.
///
/// Capabilities are queried in a fixed order: structure, context, build
/// requirements, shared code, per-application code, per-thunk code,
/// computation, cleanup, version, constant-folding eligibility.
pub fn collect_fragments(node: &ApplicationNode, position: usize) -> AssembleResult<FragmentSet> {
    let op = node.descriptor();
    let instance = instance_name(node, position);

    let inputs = bind_variables(&instance, "input", &op.input_types(), &node.input_names())?;
    let outputs = bind_variables(&instance, "output", &op.output_types(), &node.output_names())?;
    let mut seen = HashSet::new();
    for output in &outputs {
        if !seen.insert(output.name.as_str()) {
            return Err(AssembleError::configuration(
                &instance,
                format!("output variable `{}` is bound more than once", output.name),
            ));
        }
    }

    let context = match (op.runtime_context(node), op.context_type()) {
        (Some(value), Some(c_type)) => Some(RuntimeContext {
            c_type,
            init: value.init,
            member: format!("ctx_{instance}"),
        }),
        (Some(_), None) => {
            return Err(AssembleError::configuration(
                &instance,
                format!(
                    "descriptor `{}` requests a runtime context but declares no context type",
                    op.name()
                ),
            ))
        }
        (None, _) => None,
    };
    let context_expr = context
        .as_ref()
        .map(|ctx| format!("{STATE_VAR}->{}", ctx.member));

    let module_ctx = FailureContext {
        fail: format!("goto {MODULE_INIT_FAIL_LABEL};"),
        error: ERROR_VAR.to_string(),
        state: None,
        context: None,
    };
    let apply_init_ctx = FailureContext {
        fail: format!("goto {UNIT_INIT_FAIL_LABEL};"),
        ..module_ctx.clone()
    };
    let struct_init_ctx = FailureContext {
        fail: format!("goto {};", init_fail_label(position)),
        state: Some(STATE_VAR.to_string()),
        context: context_expr.clone(),
        ..module_ctx.clone()
    };
    let struct_cleanup_ctx = FailureContext {
        fail: "(void)0;".to_string(),
        state: Some(STATE_VAR.to_string()),
        context: context_expr.clone(),
        ..module_ctx.clone()
    };
    let exec_ctx = FailureContext {
        fail: format!(
            "{{ {STATUS_VAR} = 1; goto {}; }}",
            exec_cleanup_label(position)
        ),
        state: Some(STATE_VAR.to_string()),
        context: context_expr,
        ..module_ctx.clone()
    };

    let input_names = node.input_names();
    let output_names = node.output_names();

    let headers = dedup_ordered(op.headers());
    let header_dirs = dedup_ordered(op.header_dirs());
    let libraries = dedup_ordered(op.libraries());
    let lib_dirs = dedup_ordered(op.lib_dirs());
    let compile_args = dedup_ordered(op.compile_args());
    let forbidden_args = dedup_ordered(op.forbidden_compile_args());

    let module_init = op.module_init_code(&module_ctx);
    let support = op.support_code();
    let support_apply = op.support_code_apply(node, &instance);
    let init_apply = op.init_code_apply(node, &instance, &apply_init_ctx);
    let struct_support = op.struct_support_code(node, &instance);
    let struct_init = op.struct_init_code(node, &instance, &struct_init_ctx);
    let struct_cleanup = op.struct_cleanup_code(node, &instance, &struct_cleanup_ctx);
    let computation = op.computation_code(node, &instance, &input_names, &output_names, &exec_ctx);
    let cleanup = op.cleanup_code(node, &instance, &input_names, &output_names, &exec_ctx);
    let version = op.cache_version_apply(node);
    let skip_during_constant_folding = op.skip_native_during_constant_folding(node);

    Ok(FragmentSet {
        position,
        instance,
        identity: op.identity(),
        inputs,
        outputs,
        computation,
        cleanup,
        headers,
        header_dirs,
        libraries,
        lib_dirs,
        compile_args,
        forbidden_args,
        module_init,
        init_apply,
        struct_support,
        struct_init,
        struct_cleanup,
        support,
        support_apply,
        context,
        version,
        skip_during_constant_folding,
    })
}

fn bind_variables(
    instance: &str,
    role: &str,
    types: &[SlotType],
    names: &[String],
) -> AssembleResult<Vec<VariableDecl>> {
    if types.len() != names.len() {
        return Err(AssembleError::configuration(
            instance,
            format!(
                "{} {role} slot(s) declared but {} bound",
                types.len(),
                names.len()
            ),
        ));
    }
    types
        .iter()
        .zip(names)
        .map(|(ty, name)| {
            if !is_c_identifier(name) {
                return Err(AssembleError::configuration(
                    instance,
                    format!("{role} variable `{name}` is not a valid C identifier"),
                ));
            }
            Ok(VariableDecl {
                name: name.clone(),
                c_type: ty.c_type.clone(),
            })
        })
        .collect()
}

pub(crate) fn dedup_ordered(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::{ContextValue, OperationDescriptor};
    use crate::version;

    struct Scale {
        with_context_type: bool,
    }

    impl OperationDescriptor for Scale {
        fn name(&self) -> &str {
            "scale"
        }

        fn input_types(&self) -> Vec<SlotType> {
            vec![SlotType::new("float64", "double")]
        }

        fn output_types(&self) -> Vec<SlotType> {
            vec![SlotType::new("float64", "double")]
        }

        fn computation_code(
            &self,
            _node: &ApplicationNode,
            _instance: &str,
            inputs: &[String],
            outputs: &[String],
            ctx: &FailureContext,
        ) -> String {
            let factor = ctx.context.clone().unwrap_or_else(|| "1.0".to_string());
            format!("{} = {} * {factor};", outputs[0], inputs[0])
        }

        fn headers(&self) -> Vec<String> {
            vec!["math.h".to_string(), "math.h".to_string(), " ".to_string()]
        }

        fn module_init_code(&self, ctx: &FailureContext) -> String {
            state_note(ctx)
        }

        fn init_code_apply(
            &self,
            _node: &ApplicationNode,
            _instance: &str,
            ctx: &FailureContext,
        ) -> String {
            state_note(ctx)
        }

        fn struct_init_code(
            &self,
            _node: &ApplicationNode,
            _instance: &str,
            ctx: &FailureContext,
        ) -> String {
            state_note(ctx)
        }

        fn runtime_context(&self, _node: &ApplicationNode) -> Option<ContextValue> {
            Some(ContextValue::new("2.5"))
        }

        fn context_type(&self) -> Option<String> {
            self.with_context_type.then(|| "double".to_string())
        }

        fn cache_version(&self) -> Vec<VersionScalar> {
            version![1]
        }
    }

    fn state_note(ctx: &FailureContext) -> String {
        format!("/* state: {} */", ctx.state.as_deref().unwrap_or("none"))
    }

    #[test]
    fn state_is_only_named_where_a_thunk_exists() {
        let node = ApplicationNode::new(
            Arc::new(Scale {
                with_context_type: true,
            }),
            ["x"],
            ["y"],
        );
        let fragments = collect_fragments(&node, 0).expect("collect");
        assert_eq!(fragments.module_init, "/* state: none */");
        assert_eq!(fragments.init_apply, "/* state: none */");
        assert_eq!(fragments.struct_init, format!("/* state: {STATE_VAR} */"));
    }

    #[test]
    fn collects_context_and_dedups_headers() {
        let node = ApplicationNode::new(
            Arc::new(Scale {
                with_context_type: true,
            }),
            ["x"],
            ["y"],
        );
        let fragments = collect_fragments(&node, 3).expect("collect");
        assert_eq!(fragments.instance, "scale_3");
        assert_eq!(fragments.headers, vec!["math.h".to_string()]);
        assert_eq!(fragments.computation, "y = x * state->ctx_scale_3;");
        let ctx = fragments.context.expect("context");
        assert_eq!(ctx.c_type, "double");
        assert_eq!(ctx.init, "2.5");
        assert_eq!(fragments.version, version![1]);
    }

    #[test]
    fn context_without_type_is_a_configuration_error() {
        let node = ApplicationNode::new(
            Arc::new(Scale {
                with_context_type: false,
            }),
            ["x"],
            ["y"],
        );
        let err = collect_fragments(&node, 0).expect_err("missing context type");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("context type"));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let node = ApplicationNode::new(
            Arc::new(Scale {
                with_context_type: true,
            }),
            ["x", "z"],
            ["y"],
        );
        let err = collect_fragments(&node, 0).expect_err("arity");
        assert!(err.to_string().contains("1 input slot(s) declared but 2 bound"));
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        let node = ApplicationNode::new(
            Arc::new(Scale {
                with_context_type: true,
            }),
            ["x"],
            ["y-out"],
        );
        let err = collect_fragments(&node, 0).expect_err("identifier");
        assert!(err.to_string().contains("y-out"));
    }
}
