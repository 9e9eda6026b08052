#![forbid(unsafe_code)]

//! # homosilicus-harness
//!
//! Behavioral-economics experiments on language models: every persona in a
//! catalog is shown the same set of Person A / Person B payoff choices, and
//! the model answers Left or Right with a short justification.
//!
//! Runs are resumable. Each persona's answers land in one JSON document in a
//! result store; a later invocation skips personas that already have a
//! document, and the validator finds documents that are missing or unusable
//! so that only those personas are run again.
//!
//! Pipeline: [`catalog`] -> [`payload`] -> [`judge`] (over [`gateway`]) ->
//! [`store`], driven by [`runner`]; [`validate`] and [`summary`] read the
//! store afterwards.

pub mod catalog;
pub mod config;
pub mod gateway;
pub mod judge;
pub mod payload;
pub mod prompts;
pub mod runner;
pub mod store;
pub mod summary;
pub mod validate;

pub use catalog::{Persona, PersonaCatalog, ScenarioCatalog};
pub use config::{ConfigError, ExperimentConfig};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use judge::{Choice, InferenceGateway, JudgeConfig, JudgeError, Judgment, LlmJudge};
pub use payload::{build_payloads, PayloadSet, RequestUnit};
pub use runner::{RunMode, RunSummary, Runner, RunnerConfig};
pub use store::{PersonaKey, PersonaResult, ResultStore, StoreError};
pub use validate::{check_problems, missing_keys, ProblemPolicy, ValidationReport};
