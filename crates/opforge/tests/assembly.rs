use std::sync::Arc;

use opforge::{
    assemble, assemble_with, version, ApplicationNode, AssembleError, AssembleOptions,
    ContextValue, FailureContext, OperationDescriptor, SlotType, VersionScalar,
};

#[derive(Clone, Default)]
struct Affine {
    version: Vec<VersionScalar>,
    compile_args: Vec<String>,
    forbidden: Vec<String>,
    helper: &'static str,
    skip_when_folding: bool,
}

impl OperationDescriptor for Affine {
    fn name(&self) -> &str {
        "affine"
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
        _ctx: &FailureContext,
    ) -> String {
        format!("{} = helper({});", outputs[0], inputs[0])
    }

    fn support_code(&self) -> String {
        format!("static double helper(double x) {{ return {}; }}", self.helper)
    }

    fn module_init_code(&self, _ctx: &FailureContext) -> String {
        "/* warm up */".to_string()
    }

    fn compile_args(&self) -> Vec<String> {
        self.compile_args.clone()
    }

    fn forbidden_compile_args(&self) -> Vec<String> {
        self.forbidden.clone()
    }

    fn cache_version(&self) -> Vec<VersionScalar> {
        self.version.clone()
    }

    fn skip_native_during_constant_folding(&self, _node: &ApplicationNode) -> bool {
        self.skip_when_folding
    }
}

fn affine(version: Vec<VersionScalar>) -> Arc<dyn OperationDescriptor> {
    Arc::new(Affine {
        version,
        helper: "2.0 * x + 1.0",
        ..Affine::default()
    })
}

fn pair(op: Arc<dyn OperationDescriptor>) -> Vec<ApplicationNode> {
    vec![
        ApplicationNode::new(Arc::clone(&op), ["x"], ["y"]),
        ApplicationNode::new(op, ["y"], ["z"]),
    ]
}

#[test]
fn assembly_is_deterministic() {
    let first = assemble(&pair(affine(version![1]))).expect("first");
    let second = assemble(&pair(affine(version![1]))).expect("second");
    assert_eq!(first.source, second.source);
    assert_eq!(first.key, second.key);

    let bumped = assemble(&pair(affine(version![2]))).expect("bumped");
    assert_eq!(first.source, bumped.source);
    assert_ne!(first.key, bumped.key, "version participates in the key");
}

#[test]
fn shared_support_code_is_emitted_once() {
    let unit = assemble(&pair(affine(version![1]))).expect("assemble");
    assert_eq!(unit.source.matches("static double helper(").count(), 1);
    assert_eq!(unit.source.matches("/* warm up */").count(), 1);
    assert_eq!(unit.module_inits, vec!["affine".to_string()]);
    assert!(unit.source.contains("case 0: return \"affine\";"));
}

#[test]
fn conflicting_shared_code_under_one_identity_is_rejected() {
    let other: Arc<dyn OperationDescriptor> = Arc::new(Affine {
        version: version![1],
        helper: "x",
        ..Affine::default()
    });
    let nodes = vec![
        ApplicationNode::new(affine(version![1]), ["x"], ["y"]),
        ApplicationNode::new(other, ["y"], ["z"]),
    ];
    let err = assemble(&nodes).expect_err("shared code conflict");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("different shared code"));
}

#[test]
fn empty_version_makes_unit_non_cacheable() {
    let versioned = assemble(&pair(affine(version![1]))).expect("versioned");
    assert!(versioned.cacheable);
    let unversioned = assemble(&pair(affine(version![]))).expect("unversioned");
    assert!(!unversioned.cacheable);
}

#[test]
fn required_and_forbidden_arg_conflict() {
    let wants: Arc<dyn OperationDescriptor> = Arc::new(Affine {
        version: version![1],
        helper: "x",
        compile_args: vec!["-ffast-math".to_string()],
        ..Affine::default()
    });
    let vetoes: Arc<dyn OperationDescriptor> = Arc::new(Affine {
        version: version![1],
        helper: "x",
        forbidden: vec!["-ffast-math".to_string()],
        ..Affine::default()
    });
    let nodes = vec![
        ApplicationNode::new(wants, ["x"], ["y"]),
        ApplicationNode::new(vetoes, ["y"], ["z"]),
    ];
    match assemble(&nodes) {
        Err(AssembleError::ConflictingBuildRequirements {
            arg,
            required_by,
            forbidden_by,
        }) => {
            assert_eq!(arg, "-ffast-math");
            assert_eq!(required_by, "affine_0");
            assert_eq!(forbidden_by, "affine_1");
        }
        other => panic!("expected a build requirement conflict, got {other:?}"),
    }
}

#[test]
fn forbidden_args_are_recorded_without_conflict() {
    let vetoes: Arc<dyn OperationDescriptor> = Arc::new(Affine {
        version: version![1],
        helper: "2.0 * x + 1.0",
        forbidden: vec!["-O3".to_string()],
        ..Affine::default()
    });
    let unit = assemble(&pair(vetoes)).expect("assemble");
    assert_eq!(unit.requirements.forbidden_args, vec!["-O3".to_string()]);
    assert!(unit.requirements.forbids("-O3"));
}

#[test]
fn type_mismatch_between_applications_is_rejected() {
    struct Narrow;

    impl OperationDescriptor for Narrow {
        fn name(&self) -> &str {
            "narrow"
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
            _instance: &str,
            inputs: &[String],
            outputs: &[String],
            _ctx: &FailureContext,
        ) -> String {
            format!("{} = {};", outputs[0], inputs[0])
        }
    }

    let nodes = vec![
        ApplicationNode::new(affine(version![1]), ["x"], ["y"]),
        ApplicationNode::new(Arc::new(Narrow), ["y"], ["z"]),
    ];
    let err = assemble(&nodes).expect_err("type mismatch");
    assert!(err.to_string().contains("`y` is `int32_t` here but `double`"));
}

#[test]
fn context_without_type_fails_during_assembly() {
    struct Untyped;

    impl OperationDescriptor for Untyped {
        fn name(&self) -> &str {
            "untyped"
        }

        fn input_types(&self) -> Vec<SlotType> {
            Vec::new()
        }

        fn output_types(&self) -> Vec<SlotType> {
            vec![SlotType::new("int32", "int32_t")]
        }

        fn computation_code(
            &self,
            _node: &ApplicationNode,
            _instance: &str,
            _inputs: &[String],
            outputs: &[String],
            _ctx: &FailureContext,
        ) -> String {
            format!("{} = 0;", outputs[0])
        }

        fn runtime_context(&self, _node: &ApplicationNode) -> Option<ContextValue> {
            Some(ContextValue::new("42"))
        }
    }

    let nodes = vec![ApplicationNode::new(
        Arc::new(Untyped),
        Vec::<String>::new(),
        ["out"],
    )];
    let err = assemble(&nodes).expect_err("missing context type");
    assert!(err.is_configuration());
}

#[test]
fn constant_folding_leaves_out_opted_out_applications() {
    let skipping: Arc<dyn OperationDescriptor> = Arc::new(Affine {
        version: version![1],
        helper: "2.0 * x + 1.0",
        skip_when_folding: true,
        ..Affine::default()
    });
    let nodes = vec![ApplicationNode::new(skipping, ["x"], ["y"])];

    let regular = assemble(&nodes).expect("regular");
    assert_eq!(regular.instances, vec!["affine_0".to_string()]);
    assert!(regular.folded.is_empty());

    let folding = assemble_with(&nodes, &AssembleOptions::constant_folding()).expect("folding");
    assert!(folding.instances.is_empty());
    assert_eq!(folding.folded, vec!["affine_0".to_string()]);
    assert!(!folding.source.contains("static double helper("));
}

#[test]
fn compiled_unit_serializes_key_as_hex() -> anyhow::Result<()> {
    let unit = assemble(&pair(affine(version![1, "fast"])))?;
    let value = serde_json::to_value(&unit)?;
    assert_eq!(value["key"], unit.key.to_hex());
    assert_eq!(value["versions"][1]["instance"], "affine_1");

    let decoded: opforge::CompiledUnit = serde_json::from_value(value)?;
    assert_eq!(decoded.key, unit.key);
    Ok(())
}
