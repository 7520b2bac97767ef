//! Per-client session handling.
//!
//! Each client TCP connection gets a framed reader on this task and a
//! writer task draining a line queue. Inbound lines are either utterances,
//! broadcast to the mesh as `SPEECH`, or slash commands:
//!
//! - `/name <nick>` sets the speaker name for subsequent utterances
//! - `/peers` lists direct peers, `/reachable` the reachable servers
//! - `/peer-listen`, `/peer-connect`, `/peer-kill` manage peer links
//! - `/quit` closes the session
//!
//! Command failures answer with a single `ERR <code> <detail>` line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::codec::FramedRead;

use crate::error::CloseReason;
use crate::framing::{FramingError, LineCodec};
use crate::id::ServerId;
use crate::mesh::MeshHandle;
use crate::server::SharedState;
use crate::speech::{speech_payload, SPEECH};

/// Outbound line queue depth per client.
const CLIENT_QUEUE: usize = 4096;

/// Queued writes get this long to drain when a connection closes.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Handle one client TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>, mesh: MeshHandle) -> Result<()> {
    let addr = stream.peer_addr()?;
    handle_io(stream, addr, state, mesh).await
}

/// Generic over the transport, like the peer links, so tests can drive a
/// session over an in-memory pipe.
pub async fn handle_io<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<SharedState>,
    mesh: MeshHandle,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    static SESSIONS: AtomicU64 = AtomicU64::new(0);
    let session = SESSIONS.fetch_add(1, Ordering::Relaxed);
    let session_id = format!("client-{session}");
    tracing::info!(%session_id, %addr, "new client connection");

    let (read_half, write_half) = tokio::io::split(stream);
    let mut records = FramedRead::new(read_half, LineCodec::new(state.config.max_record_len));

    let (tx, rx) = mpsc::channel::<String>(CLIENT_QUEUE);
    let writer = spawn_line_writer(rx, write_half);
    state
        .connections
        .lock()
        .unwrap()
        .insert(session_id.clone(), tx.clone());

    send_to(&tx, &session_id, format!("Welcome, {addr}"));
    let mut name = format!("anon-{session}");

    loop {
        tokio::select! {
            _ = mesh.shutdown_signal() => {
                tracing::info!(%session_id, reason = %CloseReason::Shutdown, "closing client");
                send_to(&tx, &session_id, "server shutting down".to_string());
                break;
            }
            record = records.next() => match record {
                None => break,
                Some(Err(FramingError::Oversize(limit))) => {
                    tracing::warn!(%session_id, limit, reason = %CloseReason::Oversize, "client record too long");
                    send_to(&tx, &session_id, format!("ERR oversize record exceeds {limit} bytes"));
                    break;
                }
                Some(Err(FramingError::Io(e))) => {
                    tracing::warn!(%session_id, "client read error: {e}");
                    break;
                }
                Some(Ok(line)) => {
                    let Ok(text) = std::str::from_utf8(&line) else {
                        tracing::warn!(%session_id, "client sent a non-utf-8 line, ignoring");
                        continue;
                    };
                    if text.starts_with('/') {
                        if !run_command(text, &mut name, &tx, &session_id, &state, &mesh).await {
                            break;
                        }
                    } else {
                        mesh.broadcast(SPEECH, speech_payload(&name, text), None, None).await;
                    }
                }
            }
        }
    }

    state.connections.lock().unwrap().remove(&session_id);
    drop(tx);
    finish_writer(writer).await;
    tracing::info!(%session_id, "client connection closed");
    Ok(())
}

/// Dispatch one slash command. Returns `false` when the session should end.
async fn run_command(
    line: &str,
    name: &mut String,
    tx: &mpsc::Sender<String>,
    session_id: &str,
    state: &Arc<SharedState>,
    mesh: &MeshHandle,
) -> bool {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    match command {
        "/quit" => return false,

        "/name" => match args.as_slice() {
            [nick] if valid_name(nick) => *name = nick.to_string(),
            [nick] => send_to(tx, session_id, format!("ERR bad-name {nick}")),
            _ => send_to(tx, session_id, "ERR bad-args usage: /name <nick>".to_string()),
        },

        "/peers" => {
            let peers = state.peer_directory.lock().unwrap().clone();
            send_to(
                tx,
                session_id,
                format!("There are {} peers directly connected", peers.len()),
            );
            for (id, addr) in peers {
                send_to(tx, session_id, format!("  {id} {addr}"));
            }
        }

        "/reachable" => {
            let reachable = state.route_table.lock().unwrap().reachable(mesh.local_id());
            send_to(
                tx,
                session_id,
                format!("There are {} reachable servers:", reachable.len()),
            );
            for id in reachable {
                send_to(tx, session_id, format!("  {id}"));
            }
        }

        "/peer-listen" => match parse_host_port(&args) {
            None => send_to(
                tx,
                session_id,
                "ERR bad-args usage: /peer-listen <host> <port>".to_string(),
            ),
            Some(addr) => {
                if state.peer_listeners.lock().unwrap().contains(&addr) {
                    send_to(tx, session_id, format!("Already listening for peers on {addr}"));
                } else {
                    match tokio::net::TcpListener::bind(&addr).await {
                        Ok(listener) => {
                            tracing::info!(%addr, "peer listener added");
                            state.peer_listeners.lock().unwrap().insert(addr.clone());
                            tokio::spawn(crate::mesh::run_peer_listener(listener, mesh.clone()));
                            send_to(tx, session_id, format!("Listening for peers on {addr}"));
                        }
                        Err(e) => send_to(tx, session_id, format!("ERR listen-failed {e}")),
                    }
                }
            }
        },

        "/peer-connect" => match parse_host_port(&args) {
            None => send_to(
                tx,
                session_id,
                "ERR bad-args usage: /peer-connect <host> <port>".to_string(),
            ),
            Some(addr) => match mesh.connect_peer(&addr).await {
                Ok(peer_addr) => {
                    send_to(tx, session_id, format!("Connecting to peer at {peer_addr}"))
                }
                Err(e) => send_to(tx, session_id, format!("ERR connect-failed {e}")),
            },
        },

        "/peer-kill" => match parse_host_port(&args) {
            None => send_to(
                tx,
                session_id,
                "ERR bad-args usage: /peer-kill <host> <port>".to_string(),
            ),
            Some(addr) => {
                let doomed: Vec<(ServerId, SocketAddr)> = state
                    .peer_directory
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, peer_addr)| peer_addr.to_string() == addr)
                    .map(|(id, peer_addr)| (*id, *peer_addr))
                    .collect();
                for (id, peer_addr) in doomed {
                    send_to(tx, session_id, format!("Shutting down {id} {peer_addr}"));
                    mesh.close_peer(id).await;
                }
            }
        },

        _ => send_to(tx, session_id, format!("ERR unknown-command {command}")),
    }
    true
}

/// Speaker names end up on the wire as `<name>|<utterance>`, so the
/// separator and control characters are off limits.
fn valid_name(nick: &str) -> bool {
    !nick.is_empty()
        && nick.len() <= 48
        && !nick.contains('|')
        && !nick.chars().any(|c| c.is_control())
}

fn parse_host_port(args: &[&str]) -> Option<String> {
    match args {
        [host, port] => {
            let port: u16 = port.parse().ok()?;
            Some(format!("{host}:{port}"))
        }
        _ => None,
    }
}

fn send_to(tx: &mpsc::Sender<String>, session_id: &str, line: String) {
    if tx.try_send(line).is_err() {
        tracing::warn!(session_id, "client write queue full or closed");
    }
}

/// Drain a line queue onto a socket, terminating each line with CRLF.
/// Senders pass bare lines; the terminator is appended here and nowhere
/// else.
pub(crate) fn spawn_line_writer<W>(mut rx: mpsc::Receiver<String>, mut writer: W) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\r\n").await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Let a writer drain its queue, bounded by the draining grace timer.
pub(crate) async fn finish_writer(mut writer: JoinHandle<()>) {
    if timeout(DRAIN_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_with_separator_or_controls_are_rejected() {
        assert!(valid_name("alice"));
        assert!(valid_name("alice_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("al|ice"));
        assert!(!valid_name("al\x07ice"));
        assert!(!valid_name(&"x".repeat(49)));
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port(&["127.0.0.1", "9000"]),
            Some("127.0.0.1:9000".to_string())
        );
        assert_eq!(parse_host_port(&["127.0.0.1"]), None);
        assert_eq!(parse_host_port(&["127.0.0.1", "notaport"]), None);
        assert_eq!(parse_host_port(&["a", "1", "extra"]), None);
    }
}
