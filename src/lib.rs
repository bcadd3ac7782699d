//! Orchestration core for serving a local language model.
//!
//! A [`container::ModelContainer`] owns the loaded model. Generations run
//! through [`generation::Generator`], which builds a sampler chain per
//! request, submits the job to the native library and streams its output
//! back through a [`readback::ReadbackBridge`]. The tool-call pipeline and
//! the TCP command front sit on top.

pub mod cancel;
pub mod commands;
pub mod config;
pub mod container;
pub mod errors;
pub mod generation;
pub mod logging;
pub mod native;
pub mod readback;
pub mod sampling;
pub mod templating;
pub mod tools;
pub mod transport;

pub use commands::KernelServices;
pub use config::KernelConfig;
pub use container::{ContainerState, LoadOutcome, ModelContainer, ModelHandle};
pub use errors::{KernelError, KernelResult};
pub use generation::{GenerationOptions, GenerationStream, Generator};
pub use sampling::SamplingConfig;
pub use tools::ToolCallPipeline;
