//! The TCP serving loop: one task per accepted connection, each handling
//! its queries synchronously and sequentially, one upstream round trip at
//! a time. There is no forwarding table and no transaction-ID
//! substitution here — a TCP connection already serializes queries, so
//! there is nothing to correlate beyond "the reply to the query I just
//! sent on this stream".

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::counters::Counters;
use crate::engine::{ForwardingEngine, TcpDecision};

const MAX_MESSAGE: usize = 65535;

pub struct TcpServer {
    engine: Arc<ForwardingEngine>,
}

impl TcpServer {
    pub fn new(engine: Arc<ForwardingEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let engine = self.engine.clone();
            tokio::spawn(async move {
                Counters::inc(&engine.counters.tcp_connections);
                if let Err(e) = serve_connection(engine, stream, peer).await {
                    debug!(error = %e, %peer, "tcp connection ended");
                }
            });
        }
    }
}

/// Handles one connection end to end: read a length-prefixed query,
/// resolve it, write the length-prefixed reply, repeat until the client
/// goes quiet for `tcp_idle_timeout` or closes the stream.
async fn serve_connection(engine: Arc<ForwardingEngine>, mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
    loop {
        let query = match tokio::time::timeout(engine.options.tcp_idle_timeout, read_message(&mut stream)).await {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => return Ok(()),
        };

        let Some(reply) = resolve_one(&engine, &query).await else {
            continue;
        };

        write_message(&mut stream, &reply).await?;
    }
}

/// Implements §4.E's TCP fallback: classify the query the same way UDP
/// does, then either answer locally or try each eligible upstream over
/// its own short-lived TCP connection, in order, until one replies.
async fn resolve_one(engine: &ForwardingEngine, query: &[u8]) -> Option<Vec<u8>> {
    match engine.handle_query_tcp(query) {
        TcpDecision::Answer(message) => Some(message),
        TcpDecision::Drop => None,
        TcpDecision::Forward { targets, message } => {
            for upstream in targets {
                match forward_to_upstream(upstream, &message).await {
                    Ok(mut reply) => {
                        if let Some(offset) = dnsfwd_proto::find_opt_udp_size_offset(&reply) {
                            dnsfwd_proto::clamp_u16_field(&mut reply, offset, engine.options.edns_packet_max);
                        }
                        return Some(reply);
                    }
                    Err(e) => debug!(error = %e, %upstream, "tcp upstream attempt failed"),
                }
            }
            warn!("exhausted all upstreams for one tcp query");
            None
        }
    }
}

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

async fn forward_to_upstream(upstream: SocketAddr, message: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    write_message(&mut stream, message).await?;
    read_message(&mut stream)
        .await?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed without replying"))
}

/// Reads one DNS-over-TCP message: a two-byte big-endian length prefix
/// followed by that many bytes. Returns `Ok(None)` on a clean EOF before
/// any bytes of a new message arrive.
async fn read_message(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid tcp message length"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_message(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "message too large for tcp framing"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await
}
