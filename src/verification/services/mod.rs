//! Rule set construction, the pipeline and the bus-facing gate.

mod gate;
mod pipeline;
mod registry;

pub use gate::{
    DEFAULT_REJECTION_TEMPLATE, GATE_AGENT_ID, ORIGINAL_MESSAGE_ID_KEY, REJECTION_FLAG_KEY,
    VerificationGate,
};
pub use pipeline::VerificationPipeline;
pub use registry::{
    RuleRegistry, RuleSet, SanitizerFactory, SanitizerKind, SanitizerSpec, ValidatorFactory,
    ValidatorKind, ValidatorSpec, VerificationSettings,
};
