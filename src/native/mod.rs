//! Seam to the native inference library.
//!
//! Every native resource crosses this boundary as a typed opaque handle.
//! Handles are plain indices into the library's own resource tables, so a
//! stale handle can fail a lookup but can never alias freed memory here.

pub mod candle;
#[cfg(any(test, feature = "stub"))]
pub mod stub;

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

pub use self::candle::{CandleLibrary, CandleOptions};
#[cfg(any(test, feature = "stub"))]
pub use self::stub::StubLibrary;

pub type TokenId = i32;

macro_rules! native_handle {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )*
    };
}

native_handle!(ModelPtr, ContextPtr, ProcessorPtr, SamplerPtr, BufferPtr, BundleId, JobId);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<anyhow::Error> for NativeError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{:#}", err))
    }
}

pub type NativeResult<T> = Result<T, NativeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialToken {
    Bos,
    Eos,
    Eot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeCapabilities {
    pub llguidance: bool,
    pub gbnf: bool,
}

/// Buffer plus sampler root allocated together for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBundle {
    pub id: BundleId,
    pub buffer: BufferPtr,
    pub sampler: SamplerPtr,
}

/// One native sampler stage constructor with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    LogitBias(HashMap<TokenId, f32>),
    Penalties {
        last_n: i32,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    Dry {
        multiplier: f32,
        base: f32,
        allowed_length: i32,
        last_n: i32,
        sequence_breakers: Vec<String>,
    },
    Temperature(f32),
    TopNSigma(f32),
    TopK(i32),
    TopP { p: f32, min_keep: usize },
    MinP { p: f32, min_keep: usize },
    Typical { p: f32, min_keep: usize },
    MirostatV2 { seed: u32, tau: f32, eta: f32 },
    Xtc {
        probability: f32,
        threshold: f32,
        min_keep: usize,
        seed: u32,
    },
    Dist { seed: u32 },
    Grammar { grammar: String, root: String },
    Llguidance { grammar: String },
}

impl SamplerStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LogitBias(_) => "logit_bias",
            Self::Penalties { .. } => "penalties",
            Self::Dry { .. } => "dry",
            Self::Temperature(_) => "temperature",
            Self::TopNSigma(_) => "top_n_sigma",
            Self::TopK(_) => "top_k",
            Self::TopP { .. } => "top_p",
            Self::MinP { .. } => "min_p",
            Self::Typical { .. } => "typical",
            Self::MirostatV2 { .. } => "mirostat_v2",
            Self::Xtc { .. } => "xtc",
            Self::Dist { .. } => "dist",
            Self::Grammar { .. } => "grammar",
            Self::Llguidance { .. } => "llguidance",
        }
    }
}

/// Parameters of one submitted generation job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub min_tokens: u32,
    pub max_seq_len: u32,
    pub seed: u32,
    pub rewind_strings: Vec<String>,
    pub stop_strings: Vec<String>,
    pub stop_tokens: Vec<TokenId>,
    pub add_special: bool,
}

/// Call contract of the native inference library.
///
/// Buffer reads never block: the library fills the buffer from its own
/// threads and callers poll it.
pub trait NativeLibrary: Send + Sync + 'static {
    /// Returns `Ok(None)` when `progress` asked to abort the load.
    fn load_model(
        &self,
        path: &Path,
        gpu_layers: i32,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> NativeResult<Option<ModelPtr>>;
    fn init_context(&self, model: ModelPtr, ctx_len: u32, batches: u32) -> NativeResult<ContextPtr>;
    fn make_processor(&self, model: ModelPtr, context: ContextPtr, slots: u32) -> NativeResult<ProcessorPtr>;
    fn context_max_seq_len(&self, context: ContextPtr) -> u32;
    fn clear_memory(&self, context: ContextPtr);
    fn free_processor(&self, processor: ProcessorPtr);
    fn free_context(&self, context: ContextPtr);
    fn free_model(&self, model: ModelPtr);

    fn special_token_id(&self, model: ModelPtr, kind: SpecialToken) -> Option<TokenId>;
    fn token_to_text(&self, model: ModelPtr, token: TokenId) -> Option<String>;
    fn add_bos_by_default(&self, model: ModelPtr) -> bool;
    fn chat_template(&self, model: ModelPtr) -> Option<String>;
    fn capabilities(&self) -> NativeCapabilities;

    fn sampler_append(&self, chain: SamplerPtr, model: ModelPtr, stage: &SamplerStage) -> NativeResult<SamplerPtr>;

    fn create_resources(&self) -> NativeResult<ResourceBundle>;
    fn buffer_is_finished(&self, buffer: BufferPtr) -> bool;
    fn buffer_read_next(&self, buffer: BufferPtr) -> Option<(String, TokenId)>;
    fn buffer_read_status(&self, buffer: BufferPtr) -> Option<String>;
    fn release_resources(&self, bundle: BundleId);

    fn submit_work(
        &self,
        processor: ProcessorPtr,
        bundle: &ResourceBundle,
        chain: SamplerPtr,
        request: &WorkRequest,
    ) -> NativeResult<JobId>;
    /// Returns false when the job is unknown or already done.
    fn cancel_work(&self, processor: ProcessorPtr, job: JobId) -> bool;
}
