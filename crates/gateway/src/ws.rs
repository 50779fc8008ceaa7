//! Glue between an upgraded WebSocket and a [`Session`].
//!
//! Each connection gets three tasks: the session itself, a single writer that
//! owns the socket sink, and a heartbeat. Any of them failing cancels the
//! shared token, which makes the session run its teardown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        body::Bytes,
        extract::ws::{Message as WsMessage, WebSocket},
    },
    duet_common::{HeartbeatResult, Liveness, run_heartbeat},
    duet_protocol::{Message, ProtocolError},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    session::{Inbound, Outbound, Session},
    state::GatewayState,
};

/// Frames queued for the writer before producers start waiting.
const OUTBOX_CAPACITY: usize = 64;

/// Run one client connection to completion.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote: SocketAddr) {
    let conn_id = state.next_conn_id();
    info!(conn_id, %remote, "ws: new connection");

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let cancel = CancellationToken::new();
    let liveness = Arc::new(Liveness::new());

    let writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        state.write_timeout,
        cancel.clone(),
        conn_id,
    ));

    let heartbeat_cancel = cancel.child_token();
    let heartbeat = tokio::spawn({
        let liveness = Arc::clone(&liveness);
        let probe_tx = out_tx.clone();
        let settings = state.heartbeat;
        let cancel = cancel.clone();
        let heartbeat_cancel = heartbeat_cancel.clone();
        async move {
            let result = run_heartbeat(
                &liveness,
                settings,
                || {
                    let tx = probe_tx.clone();
                    async move { tx.send(Outbound::Ping).await.is_ok() }
                },
                heartbeat_cancel,
            )
            .await;
            if result != HeartbeatResult::Cancelled {
                warn!(conn_id, ?result, "ws: heartbeat failed");
                cancel.cancel();
            }
        }
    });

    let inbound = Box::pin(read_stream(stream, liveness));
    let session = Session::new(conn_id, out_tx, Arc::clone(&state));
    let exit = session.run(inbound, cancel.clone()).await;

    // The session has dropped its outbox; once the heartbeat lets go of its
    // clone the writer flushes whatever is queued and closes the socket.
    heartbeat_cancel.cancel();
    let _ = heartbeat.await;
    if tokio::time::timeout(state.write_timeout * 2, writer)
        .await
        .is_err()
    {
        debug!(conn_id, "ws: writer did not finish in time");
    }
    info!(conn_id, %remote, ?exit, "ws: connection closed");
}

/// Decoded client frames. Every frame counts as a sign of life.
fn read_stream(
    stream: SplitStream<WebSocket>,
    liveness: Arc<Liveness>,
) -> impl futures::Stream<Item = Inbound> {
    stream.filter_map(move |frame| {
        liveness.mark_alive();
        std::future::ready(classify(frame))
    })
}

fn classify(frame: Result<WsMessage, axum::Error>) -> Option<Inbound> {
    match frame {
        Ok(WsMessage::Text(text)) => Some(decode(text.as_str())),
        Ok(WsMessage::Binary(bytes)) => Some(match std::str::from_utf8(&bytes) {
            Ok(text) => decode(text),
            Err(e) => Inbound::Invalid(ProtocolError::Malformed(e.to_string())),
        }),
        Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => None,
        Ok(WsMessage::Close(_)) => Some(Inbound::Closed),
        Err(e) => Some(Inbound::Failed(e.to_string())),
    }
}

fn decode(text: &str) -> Inbound {
    match Message::decode(text) {
        Ok(msg) => Inbound::Message(msg),
        Err(e) => Inbound::Invalid(e),
    }
}

/// Sole writer for the socket. Each write is bounded by `write_timeout`; a
/// failed or stalled write cancels the connection.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    cancel: CancellationToken,
    conn_id: u64,
) {
    while let Some(out) = rx.recv().await {
        let frame = match out {
            Outbound::Frame(msg) => match msg.encode() {
                Ok(text) => WsMessage::Text(text.into()),
                Err(e) => {
                    warn!(conn_id, error = %e, "ws: failed to encode frame");
                    continue;
                },
            },
            Outbound::Ping => WsMessage::Ping(Bytes::new()),
        };
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                debug!(conn_id, error = %e, "ws: write failed");
                cancel.cancel();
                break;
            },
            Err(_) => {
                warn!(conn_id, "ws: write timed out");
                cancel.cancel();
                break;
            },
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}
