pub mod analysis;
pub mod classifier;
pub mod config;
pub mod container;
pub mod context;
pub mod coverage;
pub mod demo;
pub mod engine;
pub mod instruction;
pub mod listener;
pub mod mutator;
pub mod scheduler;
pub mod timeout;
pub mod unit;
pub mod vm;

pub use analysis::{AnalysisError, AnalysisSettings, MutationAnalysis, MutationReport, MutationStatus};
pub use classifier::{DefaultResultClassifier, ResultClassifier, ResultKind};
pub use config::{ConfigError, GauntletConfig};
pub use container::{Container, ContainerError, ResultSource, SerialContainer, ThreadPoolContainer};
pub use context::{MutationContext, MutationIdentifier};
pub use coverage::{
    ClassInstrumenter, CoverageDatabase, CoverageSink, ProbeId, ProbeMap, ProbeStrategy,
    TestCoverage,
};
pub use engine::{Mutant, MutationDetails, MutationEngine, MutationError};
pub use instruction::{ClassFile, Insn, MethodBody, MethodKey, VerifyError};
pub use listener::{RecordingListener, TestListener};
pub use mutator::{MethodMutator, MutatorRegistry, RegistryError, TemporalBoundaryMutator};
pub use scheduler::{
    ListenerFailurePolicy, OrderStrategy, RunSummary, Scheduler, SchedulerError, filter_units,
};
pub use timeout::{
    PercentAndConstantTimeoutStrategy, TimeoutDecoratedTestSource, TimeoutDecoratedUnit,
    TimeoutLengthStrategy,
};
pub use unit::{Description, FnTestUnit, TestGroup, TestOutcome, TestResult, TestUnit};
pub use vm::{Program, Value, VmError};
