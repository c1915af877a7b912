//! Topic Mapper
//!
//! A versioned catalogue of transformation rules. Each rule binds one exact
//! source topic to a set of targets whose bodies are untrusted script
//! fragments; the engine executes them in the sandbox and republishes the
//! results, with per-target counters and ring-buffered execution logs.

pub mod config;
pub mod engine;
pub mod metrics;

pub use config::{MapperConfig, MapperConfigError, Rule, Target, Version};
pub use engine::{ConfigWriteError, MapperEngine};
pub use metrics::{ExecRecord, MapperMetrics};
