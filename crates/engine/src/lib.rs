//! `engine` crate — dependency resolution, interpolation, scheduling and
//! response correlation for record-driven workflows.

pub mod models;
pub mod error;
pub mod config;
pub mod scanner;
pub mod interpolate;
pub mod dag;
pub mod protocol;
pub mod correlator;
pub mod dispatcher;
pub mod scheduler;
pub mod feedback;
pub mod orchestrator;
pub mod mock;

pub use models::{RunOptions, RunOutcome, StepDefinition, StepFailure, StepResult, Workflow};
pub use error::{EngineError, StepErrorKind};
pub use config::EngineConfig;
pub use dag::DependencyGraph;
pub use correlator::Correlator;
pub use feedback::{ChannelFeedback, FeedbackHook, FeedbackReport, NoopFeedback, RecordFeedback};
pub use orchestrator::Orchestrator;
