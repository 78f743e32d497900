//! Agent gateway: authenticated persistent duplex connections.
//!
//! Agents connect over WebSocket with a bearer api-key; each accepted
//! connection gets one reader task (frames into the router) and one writer
//! task (serialized outbound frames plus pings). One live connection per
//! agent id — the registry evicts the older one on a repeat handshake.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::AgentId;
use crate::protocol::Frame;
use crate::registry::AgentRegistry;
use crate::router::FrameRouter;
use crate::storage::{ApiKeyStore, AuditStore};

const OUTBOUND_QUEUE: usize = 256;

/// The agent-facing WebSocket server.
pub struct Gateway {
    registry: Arc<AgentRegistry>,
    api_keys: ApiKeyStore,
    audit: AuditStore,
    router: Arc<FrameRouter>,
    heartbeat: Duration,
}

impl Gateway {
    /// Wires the gateway.
    #[must_use]
    pub fn new(
        registry: Arc<AgentRegistry>,
        api_keys: ApiKeyStore,
        audit: AuditStore,
        router: Arc<FrameRouter>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            registry,
            api_keys,
            audit,
            router,
            heartbeat,
        }
    }

    /// Accept loop. Refuses new connections once `shutdown` fires; live
    /// connections are torn down through their child tokens.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "gateway listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "gateway connection accepted");
                            let gateway = Arc::clone(&self);
                            let token = shutdown.child_token();
                            tokio::spawn(async move {
                                gateway.handle_connection(stream, token).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "gateway accept failed");
                        }
                    }
                }
                () = shutdown.cancelled() => {
                    info!("gateway refusing new connections");
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, cancel: CancellationToken) {
        let mut bearer: Option<String> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            bearer = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(ToString::to_string);
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(error = %err, "websocket handshake failed");
                return;
            }
        };
        let (mut sink, mut source) = ws.split();

        let agent = match self.authenticate(bearer.as_deref()).await {
            Some(agent) => agent,
            None => {
                warn!("handshake rejected: invalid or missing api key");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let conn_id = self
            .registry
            .register(agent.clone(), outbound_tx, cancel.clone());
        let _ = self
            .audit
            .record(
                "agent:connected",
                "agent",
                agent.as_str(),
                None,
                serde_json::json!({}),
            )
            .await;

        // Writer: serializes every outbound frame and owns the ping clock.
        let writer_cancel = cancel.clone();
        let heartbeat = self.heartbeat;
        let writer_agent = agent.clone();
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let bytes = match frame.encode() {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                warn!(agent = %writer_agent, error = %err, "outbound frame encode failed");
                                continue;
                            }
                        };
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    () = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: frames into the router; pongs and traffic refresh the
        // heartbeat.
        loop {
            tokio::select! {
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.registry.mark_heartbeat(&agent);
                            match Frame::decode(text.as_bytes()) {
                                Ok(frame) => self.router.handle_frame(&agent, frame).await,
                                Err(err) => {
                                    // Unknown or malformed frames are an
                                    // invariant violation: log and drop.
                                    warn!(agent = %agent, error = %err, "undecodable frame dropped");
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.registry.mark_heartbeat(&agent);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(agent = %agent, error = %err, "websocket read error");
                            break;
                        }
                    }
                }
                () = cancel.cancelled() => break,
            }
        }

        cancel.cancel();
        let _ = writer.await;
        self.registry.deregister(&agent, conn_id);
        let _ = self
            .audit
            .record(
                "agent:disconnected",
                "agent",
                agent.as_str(),
                None,
                serde_json::json!({}),
            )
            .await;
        info!(agent = %agent, "gateway connection closed");
    }

    async fn authenticate(&self, bearer: Option<&str>) -> Option<AgentId> {
        let key = bearer?;
        match self.api_keys.validate(key).await {
            Ok(agent) => agent,
            Err(err) => {
                warn!(error = %err, "api key validation errored");
                None
            }
        }
    }
}

/// Heartbeat supervisor: agents silent for two beats get their connection
/// cancelled, which deregisters them and fires the disconnect edge.
pub async fn heartbeat_monitor(
    registry: Arc<AgentRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.cancel_stale(interval * 2);
            }
            () = cancel.cancelled() => return,
        }
    }
}
