//! Line-framed TCP command front.
//!
//! Header `VERB tag length\n`, then `length` payload bytes. Commands on one
//! connection run in order; connections run concurrently.

mod framing;
mod io;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::commands::metrics::log_event;
use crate::commands::KernelServices;

pub use self::framing::{parse_available_commands, ClientState, ParsedCommand};
pub use self::io::handle_connection;

/// Per-connection state: unparsed bytes, framing position and counters.
pub struct Connection {
    pub id: usize,
    pub peer: Option<SocketAddr>,
    pub buffer: Vec<u8>,
    pub state: ClientState,
    pub commands_served: u64,
    pub protocol_errors: u64,
    connected_at: Instant,
}

impl Connection {
    pub fn new(id: usize, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            buffer: Vec::with_capacity(4096),
            state: ClientState::WaitingForHeader,
            commands_served: 0,
            protocol_errors: 0,
            connected_at: Instant::now(),
        }
    }

    /// One-line description for the disconnect event.
    pub fn summary(&self) -> String {
        let peer = self.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        format!(
            "peer={} commands={} protocol_errors={} secs={:.1}",
            peer,
            self.commands_served,
            self.protocol_errors,
            self.connected_at.elapsed().as_secs_f64()
        )
    }
}

/// Accepts connections until the shutdown token fires.
pub async fn serve(listener: TcpListener, services: Arc<KernelServices>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "command front listening");
    }

    let mut next_client_id = 1usize;
    loop {
        let accepted = tokio::select! {
            _ = services.shutdown.cancelled() => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let client_id = next_client_id;
        next_client_id += 1;
        log_event("client_connected", client_id, None, &peer.to_string());

        let services = Arc::clone(&services);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let mut connection = Connection::new(client_id, Some(peer));
            if let Err(e) = handle_connection(reader, writer, &mut connection, &services).await {
                log_event("client_error", client_id, None, &e.to_string());
            }
            log_event("client_disconnected", client_id, None, &connection.summary());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use crate::config::KernelConfig;
    use crate::container::ModelContainer;
    use crate::generation::{GenerationOptions, Generator};
    use crate::native::{NativeLibrary, StubLibrary};

    fn services() -> Arc<KernelServices> {
        let lib: Arc<dyn NativeLibrary> = Arc::new(StubLibrary::new());
        let container = Arc::new(ModelContainer::new(lib));
        let generator = Generator::new(Arc::clone(&container), GenerationOptions::default());
        Arc::new(KernelServices::new(KernelConfig::default(), container, generator))
    }

    #[tokio::test]
    async fn connection_counts_commands_and_framing_errors() {
        let services = services();
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"PING\nBOGUS\nPING\n").await.expect("send");
        client_write.shutdown().await.expect("close");

        let peer: SocketAddr = "10.0.0.7:5100".parse().expect("addr");
        let mut connection = Connection::new(3, Some(peer));
        handle_connection(reader, writer, &mut connection, &services)
            .await
            .expect("connection");

        let mut replies = String::new();
        client_read.read_to_string(&mut replies).await.expect("replies");
        assert_eq!(replies.matches("+OK PING PONG").count(), 2);
        assert_eq!(connection.commands_served, 2);
        assert_eq!(connection.protocol_errors, 1);
        assert!(connection.summary().starts_with("peer=10.0.0.7:5100 commands=2 protocol_errors=1"));
    }

    #[tokio::test]
    async fn ping_over_tcp_then_shutdown() {
        let services = services();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(serve(listener, Arc::clone(&services)));

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"PING\nBOGUS\n").await.expect("send");

        let mut lines = BufReader::new(reader).lines();
        let pong = lines.next_line().await.expect("read").expect("line");
        assert_eq!(pong, "+OK PING PONG");
        let err = lines.next_line().await.expect("read").expect("line");
        assert!(err.starts_with("-ERR PROTOCOL"), "{}", err);

        services.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server stops")
            .expect("join")
            .expect("serve ok");
    }
}
