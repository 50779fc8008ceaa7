//! WebSocket connection to the server.
//!
//! Background tasks own the socket: a single writer, a reader that turns
//! frames into [`ConnectionEvent`]s, and a heartbeat that sends `Ping`
//! envelopes. The event loop only sees typed messages and one final `Lost`.

use std::{sync::Arc, time::Duration};

use {
    duet_common::{HeartbeatResult, HeartbeatSettings, Liveness, run_heartbeat},
    duet_protocol::{Message, ws_url},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Message),
    /// The transport is gone. Sent at most once by each background task.
    Lost(String),
}

pub struct Connection {
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Receiver<ConnectionEvent>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    write_timeout: Duration,
}

impl Connection {
    /// Dial `addr` (`host:port`) and start the background tasks.
    pub async fn connect(addr: &str, heartbeat: HeartbeatSettings) -> Result<Self, ClientError> {
        let url = ws_url(addr);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        info!(%url, "connected");

        let (sink, stream) = ws.split();
        let (outgoing, out_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (event_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let liveness = Arc::new(Liveness::new());
        let write_timeout = heartbeat.timeout;

        let writer = tokio::spawn(write_loop(sink, out_rx, event_tx.clone(), write_timeout));
        tokio::spawn(read_loop(
            stream,
            Arc::clone(&liveness),
            event_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn({
            let probe_tx = outgoing.clone();
            let cancel = cancel.clone();
            async move {
                let result = run_heartbeat(
                    &liveness,
                    heartbeat,
                    || {
                        let tx = probe_tx.clone();
                        async move { tx.send(Message::Ping).await.is_ok() }
                    },
                    cancel,
                )
                .await;
                let reason = match result {
                    HeartbeatResult::Cancelled => return,
                    HeartbeatResult::TimedOut => "server stopped responding",
                    HeartbeatResult::ProbeFailed => "heartbeat could not be sent",
                };
                warn!(reason, "heartbeat failed");
                let _ = event_tx.send(ConnectionEvent::Lost(reason.into())).await;
            }
        });

        Ok(Self {
            outgoing,
            events,
            cancel,
            writer,
            write_timeout,
        })
    }

    /// Queue one message for the writer.
    pub async fn send(&self, msg: Message) -> Result<(), ClientError> {
        match timeout(self.write_timeout, self.outgoing.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Transport("send timed out".into())),
        }
    }

    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Stop the reader and heartbeat, flush anything queued, and close the
    /// socket.
    pub async fn close(self) {
        let Self {
            outgoing,
            cancel,
            writer,
            write_timeout,
            ..
        } = self;
        cancel.cancel();
        drop(outgoing);
        if timeout(write_timeout * 2, writer).await.is_err() {
            debug!("writer did not finish in time");
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<Message>,
    events: mpsc::Sender<ConnectionEvent>,
    write_timeout: Duration,
) {
    while let Some(msg) = rx.recv().await {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                continue;
            },
        };
        let failure = match timeout(write_timeout, sink.send(WsMessage::Text(text.into()))).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_string(),
        };
        debug!(error = %failure, "write failed");
        let _ = events.send(ConnectionEvent::Lost(failure)).await;
        return;
    }
    let _ = timeout(write_timeout, sink.close()).await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    liveness: Arc<Liveness>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };
        liveness.mark_alive();
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break "server closed the connection".to_string(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
        };
        match Message::decode(text.as_str()) {
            Ok(msg) => {
                if events.send(ConnectionEvent::Message(msg)).await.is_err() {
                    return;
                }
            },
            Err(e) => warn!(error = %e, "ignoring undecodable frame"),
        }
    };
    let _ = events.send(ConnectionEvent::Lost(reason)).await;
}
