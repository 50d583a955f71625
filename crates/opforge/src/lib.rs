pub mod assembler;
pub mod cache;
pub mod collector;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod hashing;
pub mod registry;
pub mod render;
pub mod unit;

pub use assembler::{assemble, assemble_with, AssembleOptions};
pub use cache::{
    ArtifactHandle, CacheConfig, CacheStats, CompileCache, EvictOutcome, Toolchain,
};
pub use collector::{collect_fragments, instance_name, FragmentSet, VariableDecl};
pub use descriptor::{
    ApplicationNode, ContextValue, FailureContext, OperationDescriptor, Slot, SlotBinding,
    SlotType, VersionScalar,
};
pub use error::{
    AssembleError, AssembleResult, CompilationError, ForgeError, ForgeResult,
    RuntimeComputationFailure,
};
pub use hashing::CacheKey;
pub use unit::{BuildRequirements, CompiledUnit, VersionEntry};
