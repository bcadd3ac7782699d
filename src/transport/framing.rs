use inference_protocol::{CommandHeader, ProtocolError};

/// Where the connection is in the header/body cycle.
pub enum ClientState {
    WaitingForHeader,
    ReadingBody { header: CommandHeader },
}

#[derive(Debug)]
pub enum ParsedCommand {
    Ok {
        header: CommandHeader,
        payload: Vec<u8>,
    },
    Err(ProtocolError),
}

/// Pulls every complete command out of `buffer`, leaving partial input in place.
pub fn parse_available_commands(buffer: &mut Vec<u8>, state: &mut ClientState) -> Vec<ParsedCommand> {
    let mut parsed = Vec::new();

    loop {
        match state {
            ClientState::WaitingForHeader => {
                let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
                    break;
                };
                let header_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
                let header_str = String::from_utf8_lossy(&header_bytes).trim().to_string();
                if header_str.is_empty() {
                    continue;
                }

                match CommandHeader::parse(&header_str) {
                    Ok(header) if header.content_length == 0 => parsed.push(ParsedCommand::Ok {
                        header,
                        payload: Vec::new(),
                    }),
                    Ok(header) => *state = ClientState::ReadingBody { header },
                    Err(e) => parsed.push(ParsedCommand::Err(e)),
                }
            }
            ClientState::ReadingBody { header } => {
                if buffer.len() < header.content_length {
                    break;
                }
                let payload = buffer.drain(..header.content_length).collect::<Vec<u8>>();
                parsed.push(ParsedCommand::Ok {
                    header: header.clone(),
                    payload,
                });
                *state = ClientState::WaitingForHeader;
            }
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_protocol::{OpCode, ProtocolError};

    #[test]
    fn body_split_across_reads() {
        let mut state = ClientState::WaitingForHeader;
        let mut buffer = b"GEN r1 15\n{\"prompt\"".to_vec();

        assert!(parse_available_commands(&mut buffer, &mut state).is_empty());

        buffer.extend_from_slice(b":\"Hi\"}PING\n");
        let parsed = parse_available_commands(&mut buffer, &mut state);
        assert_eq!(parsed.len(), 2);
        match &parsed[0] {
            ParsedCommand::Ok { header, payload } => {
                assert_eq!(header.opcode, OpCode::Generate);
                assert_eq!(payload, b"{\"prompt\":\"Hi\"}");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&parsed[1], ParsedCommand::Ok { header, .. } if header.opcode == OpCode::Ping));
        assert!(buffer.is_empty());
    }

    #[test]
    fn blank_lines_are_skipped_and_errors_reported() {
        let mut state = ClientState::WaitingForHeader;
        let mut buffer = b"\r\n\nBOGUS\nSTATUS\n".to_vec();
        let parsed = parse_available_commands(&mut buffer, &mut state);
        assert_eq!(parsed.len(), 2);
        assert!(matches!(&parsed[0], ParsedCommand::Err(ProtocolError::UnknownOpcode(_))));
        assert!(matches!(&parsed[1], ParsedCommand::Ok { header, .. } if header.opcode == OpCode::Status));
    }
}
