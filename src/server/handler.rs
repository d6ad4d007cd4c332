//! Stream bridge between a terminal session and a WebSocket
//!
//! Runs two pumps per connection. The output pump reads the terminal on a
//! dedicated thread and forwards UTF-8-safe text frames; the input pump decodes
//! client messages into terminal input and resizes. Whichever pump stops first
//! closes the session; the output pump watches for that and closes the
//! WebSocket even if the terminal read never returns.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::protocol::ClientMessage;
use super::utf8::Utf8Reassembler;
use crate::agent::AgentSession;

/// Size of a single terminal read
const READ_BUFFER_SIZE: usize = 8192;

/// Chunks buffered between the reader thread and the WebSocket sender
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long the input side may linger once output has stopped
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Bridges one agent session to one WebSocket connection
pub struct StreamBridge {
    session: Arc<AgentSession>,
    /// Peer label used in logs
    peer: String,
}

impl StreamBridge {
    /// Create a bridge for a session
    pub fn new(session: Arc<AgentSession>, peer: impl Into<String>) -> Self {
        Self {
            session,
            peer: peer.into(),
        }
    }

    /// Run both pumps until the connection ends
    ///
    /// Returns once both pumps have stopped. The session is closed and the
    /// WebSocket sink has been closed by then.
    pub async fn run<S>(self, ws: S)
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let (sink, stream) = ws.split();

        let Some(reader) = self.session.take_output() else {
            warn!("Session {} has no output endpoint", self.session.id());
            self.session.close();
            close_sink(sink, &self.peer).await;
            return;
        };

        let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let session_id = self.session.id();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", session_id))
            .spawn(move || read_loop(reader, chunk_tx));
        if let Err(e) = spawned {
            warn!("Failed to start reader for session {}: {}", session_id, e);
            self.session.close();
            close_sink(sink, &self.peer).await;
            return;
        }

        let output = tokio::spawn(output_pump(
            Arc::clone(&self.session),
            chunk_rx,
            sink,
            self.peer.clone(),
        ));
        let input = tokio::spawn(input_pump(
            Arc::clone(&self.session),
            stream,
            self.peer.clone(),
        ));

        let mut input = input;
        if let Err(e) = output.await {
            warn!("Output pump for {} panicked: {}", self.peer, e);
        }
        // The client gets a bounded window to answer our close frame.
        match tokio::time::timeout(CLOSE_GRACE, &mut input).await {
            Ok(Err(e)) => warn!("Input pump for {} panicked: {}", self.peer, e),
            Ok(Ok(())) => {}
            Err(_) => {
                debug!("Client {} did not acknowledge close, dropping it", self.peer);
                input.abort();
            }
        }
        // A panicked pump never reached its own close.
        self.session.close();

        info!("Bridge for {} finished", self.peer);
    }
}

/// Blocking read loop; ends on EOF or the first read error
fn read_loop(mut reader: Box<dyn Read + Send>, chunk_tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("Terminal output reached EOF");
                break;
            }
            Ok(n) => {
                if chunk_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the child is gone is the usual end of a session.
                debug!("Terminal output closed: {}", e);
                break;
            }
        }
    }

    // Release the endpoint before the pump can observe the channel closing.
    drop(reader);
}

/// Forward terminal output to the client as text frames
async fn output_pump<S>(
    session: Arc<AgentSession>,
    mut chunk_rx: mpsc::Receiver<Vec<u8>>,
    mut sink: SplitSink<S, Message>,
    peer: String,
) where
    S: Sink<Message, Error = WsError>,
{
    let mut reassembler = Utf8Reassembler::new();

    loop {
        let chunk = tokio::select! {
            biased;
            // A read can outlive the session when something else still holds
            // the terminal open; the reader thread is left to finish on its own.
            _ = session.closed() => {
                debug!("Session closed, stopping output to {}", peer);
                None
            }
            chunk = chunk_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };

        let text = reassembler.process(&chunk);
        if text.is_empty() {
            continue;
        }
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("Failed to send output to {}: {}", peer, e);
            break;
        }
    }

    if !reassembler.pending().is_empty() {
        debug!(
            "Dropping {} incomplete trailing bytes for {}",
            reassembler.pending().len(),
            peer
        );
    }

    session.close();
    close_sink(sink, &peer).await;
}

/// Apply client messages to the session
async fn input_pump<S>(session: Arc<AgentSession>, mut stream: SplitStream<S>, peer: String)
where
    S: Stream<Item = Result<Message, WsError>>,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Data(data)) => {
                    if let Err(e) = session.write_input(data.as_bytes()) {
                        debug!("Failed to write input for {}: {}", peer, e);
                        break;
                    }
                }
                Ok(ClientMessage::Resize { cols, rows }) => {
                    session.set_size(cols, rows);
                }
                Err(e) if e.is_fatal() => {
                    warn!("Closing connection to {}: {}", peer, e);
                    break;
                }
                Err(e) => {
                    warn!("Dropping message from {}: {}", peer, e);
                }
            },
            Ok(Message::Binary(data)) => {
                warn!(
                    "Received binary message from {} ({} bytes), ignoring",
                    peer,
                    data.len()
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                // Pings are answered by tungstenite itself
            }
            Ok(Message::Close(_)) => {
                info!("Client {} requested close", peer);
                break;
            }
            Err(e) => {
                debug!("WebSocket error from {}: {}", peer, e);
                break;
            }
        }
    }

    session.close();
}

async fn close_sink<S>(mut sink: SplitSink<S, Message>, peer: &str)
where
    S: Sink<Message, Error = WsError>,
{
    if let Err(e) = sink.close().await {
        debug!("Closing WebSocket to {} failed: {}", peer, e);
    }
}
