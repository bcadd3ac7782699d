use std::io;

use inference_protocol::response_err;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::commands::metrics::record_command;
use crate::commands::{execute_command, KernelServices};

use super::{parse_available_commands, Connection, ParsedCommand};

/// Serves one connection until EOF, a write failure or shutdown.
pub async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    connection: &mut Connection,
    services: &KernelServices,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = services.shutdown.cancelled() => return Ok(()),
            read = reader.read(&mut chunk) => match read {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        if n == 0 {
            return Ok(());
        }
        connection.buffer.extend_from_slice(&chunk[..n]);

        let parsed = parse_available_commands(&mut connection.buffer, &mut connection.state);
        for command in parsed {
            match command {
                ParsedCommand::Ok { header, payload } => {
                    execute_command(&mut writer, header, payload, services, connection.id).await?;
                    connection.commands_served += 1;
                }
                ParsedCommand::Err(e) => {
                    connection.protocol_errors += 1;
                    record_command(false);
                    writer.write_all(&response_err("PROTOCOL", &e.to_string())).await?;
                }
            }
        }
    }
}
