//! Wire vocabulary shared by the inference kernel and its clients.

mod chunk;
mod framing;
mod tools;

pub use chunk::{FinishChunk, FinishReason, FinishRecord, GenerationChunk, StreamChunk, Timings};
pub use framing::{
    response_data, response_err, response_ok, CommandHeader, OpCode, ProtocolError,
};
pub use tools::{GeneratedToolCall, GeneratedToolFunction, ToolCall, ToolCallFunction, ToolSpec};
