//! Merges the fragments of many applications into one C compilation unit.
//!
//! Layout of the generated unit:
//!
//! 1. preamble (standard headers, `opforge_error`, `opforge_set_error`)
//! 2. headers requested by the applications
//! 3. global support code, once per descriptor identity
//! 4. per-application support code
//! 5. module init functions, once per identity with init code
//! 6. `opforge_state` holding runtime contexts and struct members
//! 7. `opforge_unit_init` running per-application init code once
//! 8. `opforge_state_new` / `opforge_state_free` with the struct init ladder
//! 9. `opforge_run` with the computation/cleanup ladder
//! 10. metadata accessors

use std::collections::HashMap;

use log::debug;

use crate::collector::{
    collect_fragments, exec_cleanup_label, init_fail_label, FragmentSet, VariableDecl, ERROR_VAR,
    MODULE_INIT_FAIL_LABEL, STATE_VAR, STATUS_VAR, UNIT_INIT_FAIL_LABEL,
};
use crate::descriptor::ApplicationNode;
use crate::error::{AssembleError, AssembleResult};
use crate::render::{escape_c_string, include_line, push_block, push_line, push_scoped};
use crate::unit::{compute_cache_key, is_cacheable, BuildRequirements, CompiledUnit, VersionEntry};

const PREAMBLE: &str = r#"
#include <stddef.h>
#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
"#;

const ERROR_SUPPORT: &str = r#"
typedef struct opforge_error {
  int code;
  char message[512];
} opforge_error;

static void opforge_set_error(opforge_error* err, int code, const char* message) {
  if (err == NULL) {
    return;
  }
  err->code = code == 0 ? -1 : code;
  snprintf(err->message, sizeof(err->message), "%s", message == NULL ? "" : message);
}
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssembleOptions {
    /// Leave out applications whose descriptor opts out of native code
    /// during constant folding.
    pub constant_folding: bool,
}

impl AssembleOptions {
    pub fn constant_folding() -> Self {
        Self {
            constant_folding: true,
        }
    }
}

pub fn assemble(nodes: &[ApplicationNode]) -> AssembleResult<CompiledUnit> {
    assemble_with(nodes, &AssembleOptions::default())
}

pub fn assemble_with(
    nodes: &[ApplicationNode],
    options: &AssembleOptions,
) -> AssembleResult<CompiledUnit> {
    let mut fragments = Vec::with_capacity(nodes.len());
    let mut folded = Vec::new();
    for (position, node) in nodes.iter().enumerate() {
        let set = collect_fragments(node, position)?;
        if options.constant_folding && set.skip_during_constant_folding {
            folded.push(set.instance);
            continue;
        }
        fragments.push(set);
    }

    let shared = SharedCode::collect(&fragments)?;
    let variables = VariableTable::build(&fragments)?;
    let requirements = merge_requirements(&fragments)?;

    let mut source = String::new();
    emit_preamble(&mut source, &fragments, &requirements);
    emit_support(&mut source, &fragments, &shared);
    emit_module_inits(&mut source, &shared);
    emit_state_struct(&mut source, &fragments);
    emit_unit_init(&mut source, &fragments);
    emit_state_lifecycle(&mut source, &fragments);
    emit_run(&mut source, &fragments, &variables);
    emit_metadata(&mut source, &variables, &shared);

    let versions: Vec<VersionEntry> = fragments
        .iter()
        .map(|set| VersionEntry {
            instance: set.instance.clone(),
            identity: set.identity.clone(),
            version: set.version.clone(),
        })
        .collect();
    let key = compute_cache_key(&source, &requirements, &versions);
    let cacheable = is_cacheable(&versions);
    debug!(
        "assembled unit {} ({} application(s), {} folded, cacheable={cacheable})",
        key.short(),
        fragments.len(),
        folded.len()
    );

    Ok(CompiledUnit {
        key,
        cacheable,
        source,
        requirements,
        versions,
        inputs: variables.inputs,
        outputs: variables.outputs,
        module_inits: shared.module_inits.into_iter().map(|(id, _)| id).collect(),
        instances: fragments.into_iter().map(|set| set.instance).collect(),
        folded,
    })
}

/// Global support and module init code, deduplicated by identity.
struct SharedCode {
    support: Vec<(String, String)>,
    module_inits: Vec<(String, String)>,
}

impl SharedCode {
    fn collect(fragments: &[FragmentSet]) -> AssembleResult<Self> {
        let mut seen: HashMap<&str, &FragmentSet> = HashMap::new();
        let mut support = Vec::new();
        let mut module_inits = Vec::new();
        for set in fragments {
            if let Some(first) = seen.get(set.identity.as_str()) {
                if first.support != set.support || first.module_init != set.module_init {
                    return Err(AssembleError::configuration(
                        &set.instance,
                        format!(
                            "descriptor identity `{}` contributes different shared code \
                             than `{}`",
                            set.identity, first.instance
                        ),
                    ));
                }
                continue;
            }
            seen.insert(set.identity.as_str(), set);
            if !set.support.trim().is_empty() {
                support.push((set.identity.clone(), set.support.clone()));
            }
            if !set.module_init.trim().is_empty() {
                module_inits.push((set.identity.clone(), set.module_init.clone()));
            }
        }
        Ok(Self {
            support,
            module_inits,
        })
    }
}

/// Unit-level variables: what the caller supplies and what the unit produces.
struct VariableTable {
    inputs: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
}

impl VariableTable {
    fn build(fragments: &[FragmentSet]) -> AssembleResult<Self> {
        let mut types: HashMap<&str, (&str, &str)> = HashMap::new();
        let mut producer: HashMap<&str, &str> = HashMap::new();
        let mut consumers: HashMap<&str, &str> = HashMap::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        for set in fragments {
            for var in set.inputs.iter().chain(set.outputs.iter()) {
                match types.get(var.name.as_str()) {
                    Some((c_type, owner)) if *c_type != var.c_type => {
                        return Err(AssembleError::configuration(
                            &set.instance,
                            format!(
                                "variable `{}` is `{}` here but `{c_type}` in `{owner}`",
                                var.name, var.c_type
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        types.insert(
                            var.name.as_str(),
                            (var.c_type.as_str(), set.instance.as_str()),
                        );
                    }
                }
            }

            for var in &set.inputs {
                if !producer.contains_key(var.name.as_str())
                    && !consumers.contains_key(var.name.as_str())
                {
                    inputs.push(var.clone());
                }
                consumers
                    .entry(var.name.as_str())
                    .or_insert(set.instance.as_str());
            }
            for var in &set.outputs {
                if let Some(previous) = producer.get(var.name.as_str()) {
                    return Err(AssembleError::configuration(
                        &set.instance,
                        format!("variable `{}` is already produced by `{previous}`", var.name),
                    ));
                }
                if let Some(consumer) = consumers.get(var.name.as_str()) {
                    return Err(AssembleError::configuration(
                        &set.instance,
                        format!(
                            "variable `{}` is consumed by `{consumer}` before it is produced; \
                             applications must be in topological order",
                            var.name
                        ),
                    ));
                }
                producer.insert(var.name.as_str(), set.instance.as_str());
                outputs.push(var.clone());
            }
        }

        Ok(Self { inputs, outputs })
    }

    fn all(&self) -> impl Iterator<Item = &VariableDecl> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

fn merge_requirements(fragments: &[FragmentSet]) -> AssembleResult<BuildRequirements> {
    for set in fragments {
        for arg in &set.compile_args {
            if let Some(forbidder) = fragments
                .iter()
                .find(|other| other.forbidden_args.contains(arg))
            {
                return Err(AssembleError::ConflictingBuildRequirements {
                    arg: arg.clone(),
                    required_by: set.instance.clone(),
                    forbidden_by: forbidder.instance.clone(),
                });
            }
        }
    }

    let mut reqs = BuildRequirements::default();
    for set in fragments {
        extend_unique(&mut reqs.headers, &set.headers);
        extend_unique(&mut reqs.header_dirs, &set.header_dirs);
        extend_unique(&mut reqs.libraries, &set.libraries);
        extend_unique(&mut reqs.lib_dirs, &set.lib_dirs);
        extend_unique(&mut reqs.compile_args, &set.compile_args);
        extend_unique(&mut reqs.forbidden_args, &set.forbidden_args);
    }
    Ok(reqs)
}

fn extend_unique(into: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !into.contains(value) {
            into.push(value.clone());
        }
    }
}

fn emit_preamble(out: &mut String, fragments: &[FragmentSet], reqs: &BuildRequirements) {
    push_line(
        out,
        0,
        &format!("/* opforge unit: {} application(s) */", fragments.len()),
    );
    push_block(out, 0, PREAMBLE);
    for header in &reqs.headers {
        push_line(out, 0, &include_line(header));
    }
    out.push('\n');
    push_block(out, 0, ERROR_SUPPORT);
}

fn emit_support(out: &mut String, fragments: &[FragmentSet], shared: &SharedCode) {
    for (identity, code) in &shared.support {
        out.push('\n');
        push_line(out, 0, &format!("/* support: {identity} */"));
        push_block(out, 0, code);
    }
    for set in fragments {
        if set.support_apply.trim().is_empty() {
            continue;
        }
        out.push('\n');
        push_line(out, 0, &format!("/* support: {} */", set.instance));
        push_block(out, 0, &set.support_apply);
    }
}

fn emit_module_inits(out: &mut String, shared: &SharedCode) {
    for (idx, (identity, code)) in shared.module_inits.iter().enumerate() {
        out.push('\n');
        push_line(out, 0, &format!("/* module init: {identity} */"));
        push_line(
            out,
            0,
            &format!("int opforge_module_init_{idx}(opforge_error* {ERROR_VAR}) {{"),
        );
        push_scoped(out, 1, "init", code);
        push_line(out, 1, "return 0;");
        push_line(out, 0, &format!("{MODULE_INIT_FAIL_LABEL}:"));
        push_line(out, 1, "return 1;");
        push_line(out, 0, "}");
    }
}

fn emit_state_struct(out: &mut String, fragments: &[FragmentSet]) {
    out.push('\n');
    push_line(out, 0, "typedef struct opforge_state {");
    push_line(out, 1, "int opforge_reserved;");
    for set in fragments {
        if let Some(ctx) = &set.context {
            push_line(out, 1, &format!("{} {};", ctx.c_type, ctx.member));
        }
        if !set.struct_support.trim().is_empty() {
            push_line(out, 1, &format!("/* members: {} */", set.instance));
            push_block(out, 1, &set.struct_support);
        }
    }
    push_line(out, 0, "} opforge_state;");
}

fn emit_unit_init(out: &mut String, fragments: &[FragmentSet]) {
    out.push('\n');
    push_line(out, 0, "static int opforge_unit_ready = 0;");
    let pending: Vec<&FragmentSet> = fragments
        .iter()
        .filter(|set| !set.init_apply.trim().is_empty())
        .collect();
    for set in &pending {
        push_line(out, 0, &format!("static int {} = 0;", init_done_flag(set.position)));
    }
    push_line(
        out,
        0,
        &format!("int opforge_unit_init(opforge_error* {ERROR_VAR}) {{"),
    );
    push_line(out, 1, "if (opforge_unit_ready) {");
    push_line(out, 2, "return 0;");
    push_line(out, 1, "}");
    // Applications that already finished are skipped when an earlier call
    // failed part way.
    for set in pending {
        let flag = init_done_flag(set.position);
        push_line(out, 1, &format!("if (!{flag}) {{"));
        push_scoped(out, 2, &format!("init: {}", set.instance), &set.init_apply);
        push_line(out, 2, &format!("{flag} = 1;"));
        push_line(out, 1, "}");
    }
    push_line(out, 1, "opforge_unit_ready = 1;");
    push_line(out, 1, "return 0;");
    push_line(out, 0, &format!("{UNIT_INIT_FAIL_LABEL}:"));
    push_line(out, 1, "return 1;");
    push_line(out, 0, "}");
}

fn init_done_flag(position: usize) -> String {
    format!("opforge_init_done_{position}")
}

fn emit_state_lifecycle(out: &mut String, fragments: &[FragmentSet]) {
    out.push('\n');
    push_line(
        out,
        0,
        &format!("opforge_state* opforge_state_new(opforge_error* {ERROR_VAR}) {{"),
    );
    push_line(
        out,
        1,
        &format!("opforge_state* {STATE_VAR} = (opforge_state*)calloc(1, sizeof(opforge_state));"),
    );
    push_line(out, 1, &format!("if ({STATE_VAR} == NULL) {{"));
    push_line(
        out,
        2,
        &format!("opforge_set_error({ERROR_VAR}, -1, \"out of memory allocating thunk state\");"),
    );
    push_line(out, 2, "return NULL;");
    push_line(out, 1, "}");
    for set in fragments {
        if let Some(ctx) = &set.context {
            push_line(
                out,
                1,
                &format!("{STATE_VAR}->{} = ({});", ctx.member, ctx.init),
            );
        }
    }
    for set in fragments {
        push_scoped(
            out,
            1,
            &format!("struct init: {}", set.instance),
            &set.struct_init,
        );
    }
    push_line(out, 1, &format!("return {STATE_VAR};"));
    // Failure of init k lands on its label and releases k-1 down to 0.
    for (idx, set) in fragments.iter().enumerate().rev() {
        push_line(out, 0, &format!("{}:", init_fail_label(set.position)));
        if idx > 0 {
            let previous = &fragments[idx - 1];
            push_scoped(
                out,
                1,
                &format!("struct cleanup: {}", previous.instance),
                &previous.struct_cleanup,
            );
        }
    }
    push_line(out, 1, &format!("free({STATE_VAR});"));
    push_line(out, 1, "return NULL;");
    push_line(out, 0, "}");

    out.push('\n');
    push_line(
        out,
        0,
        &format!("void opforge_state_free(opforge_state* {STATE_VAR}) {{"),
    );
    push_line(out, 1, &format!("opforge_error* {ERROR_VAR} = NULL;"));
    push_line(out, 1, &format!("(void){ERROR_VAR};"));
    push_line(out, 1, &format!("if ({STATE_VAR} == NULL) {{"));
    push_line(out, 2, "return;");
    push_line(out, 1, "}");
    for set in fragments.iter().rev() {
        push_scoped(
            out,
            1,
            &format!("struct cleanup: {}", set.instance),
            &set.struct_cleanup,
        );
    }
    push_line(out, 1, &format!("free({STATE_VAR});"));
    push_line(out, 0, "}");
}

fn emit_run(out: &mut String, fragments: &[FragmentSet], variables: &VariableTable) {
    out.push('\n');
    push_line(
        out,
        0,
        &format!(
            "int opforge_run(opforge_state* {STATE_VAR}, void* const* inputs, \
             void* const* outputs, opforge_error* {ERROR_VAR}) {{"
        ),
    );
    push_line(out, 1, &format!("int {STATUS_VAR} = 0;"));
    push_line(out, 1, &format!("(void){STATE_VAR};"));
    push_line(out, 1, "(void)inputs;");
    push_line(out, 1, "(void)outputs;");
    for var in variables.all() {
        push_line(out, 1, &format!("{} {};", var.c_type, var.name));
        push_line(out, 1, &format!("memset(&{0}, 0, sizeof({0}));", var.name));
    }
    for (idx, var) in variables.inputs.iter().enumerate() {
        push_line(
            out,
            1,
            &format!("{} = *(const {}*)inputs[{idx}];", var.name, var.c_type),
        );
    }
    for set in fragments {
        push_scoped(
            out,
            1,
            &format!("compute: {}", set.instance),
            &set.computation,
        );
    }
    for (idx, var) in variables.outputs.iter().enumerate() {
        push_line(
            out,
            1,
            &format!("*({}*)outputs[{idx}] = {};", var.c_type, var.name),
        );
    }
    for set in fragments.iter().rev() {
        push_line(out, 0, &format!("{}:", exec_cleanup_label(set.position)));
        push_scoped(out, 1, &format!("cleanup: {}", set.instance), &set.cleanup);
    }
    push_line(out, 1, &format!("return {STATUS_VAR};"));
    push_line(out, 0, "}");
}

fn emit_metadata(out: &mut String, variables: &VariableTable, shared: &SharedCode) {
    out.push('\n');
    push_line(
        out,
        0,
        &format!(
            "size_t opforge_input_count(void) {{ return {}; }}",
            variables.inputs.len()
        ),
    );
    push_line(
        out,
        0,
        &format!(
            "size_t opforge_output_count(void) {{ return {}; }}",
            variables.outputs.len()
        ),
    );
    push_line(
        out,
        0,
        &format!(
            "size_t opforge_module_count(void) {{ return {}; }}",
            shared.module_inits.len()
        ),
    );
    push_line(out, 0, "const char* opforge_module_identity(size_t index) {");
    push_line(out, 1, "switch (index) {");
    for (idx, (identity, _)) in shared.module_inits.iter().enumerate() {
        push_line(
            out,
            2,
            &format!("case {idx}: return \"{}\";", escape_c_string(identity)),
        );
    }
    push_line(out, 2, "default: return NULL;");
    push_line(out, 1, "}");
    push_line(out, 0, "}");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::{FailureContext, OperationDescriptor, SlotType, VersionScalar};
    use crate::version;

    struct Tagged {
        tag: &'static str,
    }

    impl OperationDescriptor for Tagged {
        fn name(&self) -> &str {
            self.tag
        }

        fn input_types(&self) -> Vec<SlotType> {
            vec![SlotType::new("int32", "int32_t")]
        }

        fn output_types(&self) -> Vec<SlotType> {
            vec![SlotType::new("int32", "int32_t")]
        }

        fn computation_code(
            &self,
            _node: &ApplicationNode,
            instance: &str,
            inputs: &[String],
            outputs: &[String],
            _ctx: &FailureContext,
        ) -> String {
            format!("{} = {} + 1; /* run {instance} */", outputs[0], inputs[0])
        }

        fn cleanup_code(
            &self,
            _node: &ApplicationNode,
            instance: &str,
            _inputs: &[String],
            _outputs: &[String],
            _ctx: &FailureContext,
        ) -> String {
            format!("/* release {instance} */")
        }

        fn init_code_apply(
            &self,
            _node: &ApplicationNode,
            instance: &str,
            _ctx: &FailureContext,
        ) -> String {
            format!("/* load {instance} */")
        }

        fn struct_init_code(
            &self,
            _node: &ApplicationNode,
            instance: &str,
            _ctx: &FailureContext,
        ) -> String {
            format!("/* acquire state {instance} */")
        }

        fn struct_cleanup_code(
            &self,
            _node: &ApplicationNode,
            instance: &str,
            _ctx: &FailureContext,
        ) -> String {
            format!("/* release state {instance} */")
        }

        fn cache_version(&self) -> Vec<VersionScalar> {
            version![1]
        }
    }

    fn chain(len: usize) -> Vec<ApplicationNode> {
        let op: Arc<dyn OperationDescriptor> = Arc::new(Tagged { tag: "inc" });
        (0..len)
            .map(|idx| {
                ApplicationNode::new(
                    Arc::clone(&op),
                    [format!("v{idx}")],
                    [format!("v{}", idx + 1)],
                )
            })
            .collect()
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("`{needle}` missing from unit:\n{haystack}"))
    }

    #[test]
    fn chain_wires_inputs_and_outputs() {
        let unit = assemble(&chain(3)).expect("assemble");
        let inputs: Vec<_> = unit.inputs.iter().map(|v| v.name.as_str()).collect();
        let outputs: Vec<_> = unit.outputs.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(inputs, vec!["v0"]);
        assert_eq!(outputs, vec!["v1", "v2", "v3"]);
        assert_eq!(unit.instances, vec!["inc_0", "inc_1", "inc_2"]);
        assert!(unit.cacheable);
    }

    #[test]
    fn computation_runs_in_order_and_cleanup_in_reverse() {
        let unit = assemble(&chain(3)).expect("assemble");
        let src = &unit.source;
        let run = position(src, "/* run inc_0 */");
        assert!(run < position(src, "/* run inc_1 */"));
        assert!(position(src, "/* run inc_1 */") < position(src, "/* run inc_2 */"));
        let c2 = position(src, "/* release inc_2 */");
        let c1 = position(src, "/* release inc_1 */");
        let c0 = position(src, "/* release inc_0 */");
        assert!(position(src, "/* run inc_2 */") < c2);
        assert!(c2 < c1 && c1 < c0);
        assert!(position(src, "opforge_exec_cleanup_1:") < c1);
    }

    #[test]
    fn struct_init_failure_ladder_skips_failing_application() {
        let unit = assemble(&chain(3)).expect("assemble");
        let src = &unit.source;
        let new_start = position(src, "opforge_state* opforge_state_new");
        let free_start = position(src, "void opforge_state_free");
        let ladder = &src[new_start..free_start];

        let fail2 = position(ladder, "opforge_init_fail_2:");
        let fail1 = position(ladder, "opforge_init_fail_1:");
        let fail0 = position(ladder, "opforge_init_fail_0:");
        let release1 = position(ladder, "/* release state inc_1 */");
        let release0 = position(ladder, "/* release state inc_0 */");
        // init 2 failing releases 1 then 0, never 2
        assert!(fail2 < release1 && release1 < fail1 && fail1 < release0 && release0 < fail0);
        assert!(!ladder.contains("/* release state inc_2 */"));

        let teardown = &src[free_start..];
        let r2 = position(teardown, "/* release state inc_2 */");
        let r1 = position(teardown, "/* release state inc_1 */");
        let r0 = position(teardown, "/* release state inc_0 */");
        assert!(r2 < r1 && r1 < r0);
    }

    #[test]
    fn each_application_init_runs_behind_its_own_flag() {
        let unit = assemble(&chain(2)).expect("assemble");
        let src = &unit.source;
        assert!(src.contains("static int opforge_init_done_0 = 0;"));
        assert!(src.contains("static int opforge_init_done_1 = 0;"));

        let init = &src[position(src, "int opforge_unit_init(")
            ..position(src, "opforge_state* opforge_state_new")];
        let guard0 = position(init, "if (!opforge_init_done_0) {");
        let load0 = position(init, "/* load inc_0 */");
        let done0 = position(init, "opforge_init_done_0 = 1;");
        let guard1 = position(init, "if (!opforge_init_done_1) {");
        let load1 = position(init, "/* load inc_1 */");
        assert!(guard0 < load0 && load0 < done0 && done0 < guard1 && guard1 < load1);
    }

    #[test]
    fn reassembly_is_byte_identical() {
        let first = assemble(&chain(4)).expect("first");
        let second = assemble(&chain(4)).expect("second");
        assert_eq!(first.source, second.source);
        assert_eq!(first.key, second.key);
        assert_eq!(first, second);
    }

    #[test]
    fn double_producer_is_rejected() {
        let op: Arc<dyn OperationDescriptor> = Arc::new(Tagged { tag: "inc" });
        let nodes = vec![
            ApplicationNode::new(Arc::clone(&op), ["a"], ["b"]),
            ApplicationNode::new(Arc::clone(&op), ["a"], ["b"]),
        ];
        let err = assemble(&nodes).expect_err("double producer");
        assert!(err.to_string().contains("already produced by `inc_0`"));
    }

    #[test]
    fn non_topological_order_is_rejected() {
        let op: Arc<dyn OperationDescriptor> = Arc::new(Tagged { tag: "inc" });
        let nodes = vec![
            ApplicationNode::new(Arc::clone(&op), ["b"], ["c"]),
            ApplicationNode::new(Arc::clone(&op), ["a"], ["b"]),
        ];
        let err = assemble(&nodes).expect_err("order");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("topological"));
    }

    #[test]
    fn empty_graph_still_assembles() {
        let unit = assemble(&[]).expect("empty");
        assert!(unit.inputs.is_empty());
        assert!(unit.source.contains("int opforge_run("));
        assert!(unit.source.contains("size_t opforge_module_count(void) { return 0; }"));
    }
}
