use std::fmt;

use thiserror::Error;

/// Step of a request at which a native call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Context,
    Sampler,
    Submit,
    Readback,
    Generate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Load => "load",
            Self::Context => "context",
            Self::Sampler => "sampler",
            Self::Submit => "submit",
            Self::Readback => "readback",
            Self::Generate => "generate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("a model load is already in progress")]
    LoadInProgress,

    #[error("model '{0}' is already loaded; unload it first")]
    AlreadyLoaded(String),

    #[error("model name not provided")]
    MissingModelName,

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("model is being unloaded; new generations are refused")]
    ModelClosing,

    #[error("request {request_id} cancelled before producing output")]
    Cancelled { request_id: String },

    #[error("native inference failed (request {request_id}, phase {phase}): {message}")]
    NativeInference {
        request_id: String,
        phase: Phase,
        message: String,
    },

    #[error("could not allocate generation resources: {0}")]
    BufferAllocation(String),

    #[error("prompt exceeds max context length of {max_seq_len}")]
    ContextExceeded { request_id: String, max_seq_len: u32 },

    #[error("template error: {0}")]
    Template(String),

    #[error("invalid tool call output: {0}")]
    ToolCallParse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] inference_protocol::ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub(crate) fn native(request_id: &str, phase: Phase, message: impl fmt::Display) -> Self {
        Self::NativeInference {
            request_id: request_id.to_string(),
            phase,
            message: message.to_string(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Stable code sent on the wire with `-ERR`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LoadInProgress => "LOAD_IN_PROGRESS",
            Self::AlreadyLoaded(_) => "ALREADY_LOADED",
            Self::MissingModelName => "MISSING_MODEL_NAME",
            Self::NoModelLoaded => "NO_MODEL",
            Self::ModelClosing => "MODEL_CLOSING",
            Self::Cancelled { .. } => "CANCELLED",
            Self::NativeInference { .. } => "NATIVE_INFERENCE",
            Self::BufferAllocation(_) => "BUFFER_ALLOCATION",
            Self::ContextExceeded { .. } => "CONTEXT_EXCEEDED",
            Self::Template(_) => "TEMPLATE",
            Self::ToolCallParse(_) => "TOOL_CALL_PARSE",
            Self::Config(_) => "CONFIG",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Protocol(_) => "PROTOCOL",
            Self::Io(_) => "IO",
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
