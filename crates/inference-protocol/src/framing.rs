use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty header")]
    EmptyHeader,
    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),
    #[error("invalid content length: {0}")]
    InvalidLength(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Ping,
    Load,
    Unload,
    Generate,
    Stream,
    Chat,
    Status,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Load => "LOAD",
            Self::Unload => "UNLOAD",
            Self::Generate => "GEN",
            Self::Stream => "STREAM",
            Self::Chat => "CHAT",
            Self::Status => "STATUS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub tag: String,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses a header line: "VERB tag length", e.g. "GEN req_01 42".
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let verb = parts.first().ok_or(ProtocolError::EmptyHeader)?;

        let opcode = match verb.to_uppercase().as_str() {
            "PING" => OpCode::Ping,
            "LOAD" => OpCode::Load,
            "UNLOAD" => OpCode::Unload,
            "GEN" => OpCode::Generate,
            "STREAM" => OpCode::Stream,
            "CHAT" => OpCode::Chat,
            "STATUS" => OpCode::Status,
            _ => return Err(ProtocolError::UnknownOpcode(verb.to_string())),
        };

        // Commands without arguments (PING, STATUS) default to the system tag.
        let tag = parts.get(1).map(|s| s.to_string()).unwrap_or_else(|| "sys".to_string());

        let content_length = match parts.get(2) {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidLength(raw.to_string()))?,
            None => 0,
        };

        Ok(Self {
            opcode,
            tag,
            content_length,
        })
    }
}

pub fn response_ok(code: &str, msg: &str) -> Vec<u8> {
    format!("+OK {} {}\r\n", code, msg).into_bytes()
}

pub fn response_err(code: &str, msg: &str) -> Vec<u8> {
    format!("-ERR {} {}\r\n", code, msg.replace(['\r', '\n'], " ")).into_bytes()
}

pub fn response_data(kind: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("DATA {} {}\r\n", kind, data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}
