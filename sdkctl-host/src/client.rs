//! Host-side session driver.
//!
//! [`run`] owns an [`SdkCtlSocket`] and turns its callbacks into
//! [`ClientEvent`]s on an unbounded channel, so the reactions happen
//! outside the engine's callbacks. Once the service enables its port,
//! the [`Plan`] is sent exactly once.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sdkctl_core::{
    AsyncIoAction, AsyncIoState, PortStatus, SdkCtlError, SdkCtlHandler, SdkCtlMessage,
    SdkCtlSocket,
};

use crate::config::HostConfig;

// ── Plan ─────────────────────────────────────────────────────────

/// What to send once the port is enabled.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Payloads of one-way messages.
    pub messages: Vec<String>,
    /// Message type for `messages`.
    pub message_type: i32,
    /// Payload of a single query, if any.
    pub query: Option<String>,
    /// Return as soon as every message came back and the query finished.
    pub exit_when_done: bool,
}

impl Plan {
    fn expected_events(&self) -> usize {
        self.messages.len() + usize::from(self.query.is_some())
    }
}

/// What a finished [`run`] saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Messages received from the service, as `(type, payload)`.
    pub messages: Vec<(i32, Vec<u8>)>,
    /// Query replies received, as `(query_id, payload)`.
    pub replies: Vec<(i32, Vec<u8>)>,
    /// Queries that ended without a reply.
    pub failed_queries: usize,
    /// Sessions lost after being established.
    pub reconnects: usize,
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ClientEvent {
    /// The service refused the handshake.
    Rejected(PortStatus),
    /// An established session dropped; the engine reconnects.
    Lost,
    Port(PortStatus),
    Message { msg_type: i32, payload: Vec<u8> },
    Reply { query_id: i32, payload: Vec<u8> },
    QueryFailed { query_id: i32, state: AsyncIoState },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Rejected(status) => write!(f, "rejected ({status})"),
            ClientEvent::Lost => f.write_str("lost"),
            ClientEvent::Port(status) => write!(f, "port {status}"),
            ClientEvent::Message { msg_type, payload } => {
                write!(f, "message {msg_type} ({} bytes)", payload.len())
            }
            ClientEvent::Reply { query_id, payload } => {
                write!(f, "reply {query_id} ({} bytes)", payload.len())
            }
            ClientEvent::QueryFailed { query_id, state } => write!(f, "query {query_id} {state}"),
        }
    }
}

struct HostHandler {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SdkCtlHandler for HostHandler {
    fn on_socket_connection(&self, sdkctl: &SdkCtlSocket, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Succeeded => AsyncIoAction::Done,
            AsyncIoState::Failed if !sdkctl.is_handshake_ok() => {
                let _ = self.events.send(ClientEvent::Rejected(sdkctl.port_status()));
                AsyncIoAction::Abort
            }
            AsyncIoState::Failed => {
                warn!(service = %sdkctl.service_name(), error = ?sdkctl.last_error(), "session lost");
                let _ = self.events.send(ClientEvent::Lost);
                AsyncIoAction::Retry
            }
            _ => AsyncIoAction::Done,
        }
    }

    fn on_port_connection(&self, _sdkctl: &SdkCtlSocket, status: PortStatus) {
        let _ = self.events.send(ClientEvent::Port(status));
    }

    fn on_message(&self, _sdkctl: &SdkCtlSocket, message: &SdkCtlMessage) {
        let _ = self.events.send(ClientEvent::Message {
            msg_type: message.msg_type(),
            payload: message.payload().to_vec(),
        });
    }
}

// ── Driver ───────────────────────────────────────────────────────

/// Connect, wait for the port, send `plan` and report what comes back.
///
/// Must run inside a [`tokio::task::LocalSet`]. Returns on Ctrl-C, once
/// the plan is done when [`Plan::exit_when_done`] is set, or with an
/// error when the service refuses the handshake.
pub async fn run(config: &HostConfig, plan: Plan) -> Result<Summary, SdkCtlError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sdkctl = SdkCtlSocket::new(
        config.network.reconnect_timeout(),
        config.service.name.clone(),
        HostHandler { events: tx.clone() },
    );
    sdkctl.init_recycler(config.recycler.data_size, config.recycler.max_blocks);
    sdkctl.connect(config.network.port, config.network.retry_timeout());

    let mut summary = Summary::default();
    let mut plan_sent = false;
    let mut pending = 0usize;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, disconnecting");
                break;
            }
        };
        let Some(event) = event else { break };
        debug!(%event, "client event");

        match event {
            ClientEvent::Rejected(status) => {
                sdkctl.disconnect();
                return Err(SdkCtlError::Other(format!(
                    "service {} refused the handshake: {status}",
                    config.service.name
                )));
            }
            ClientEvent::Lost => summary.reconnects += 1,
            ClientEvent::Port(PortStatus::PortEnabled) if !plan_sent => {
                info!(service = %sdkctl.service_name(), "port enabled");
                plan_sent = true;
                pending = plan.expected_events();
                send_plan(&sdkctl, config, &plan, &tx)?;
            }
            ClientEvent::Port(status) => info!(service = %sdkctl.service_name(), %status, "port status"),
            ClientEvent::Message { msg_type, payload } => {
                info!(msg_type, payload = %String::from_utf8_lossy(&payload), "message");
                summary.messages.push((msg_type, payload));
                pending = pending.saturating_sub(1);
            }
            ClientEvent::Reply { query_id, payload } => {
                info!(query_id, payload = %String::from_utf8_lossy(&payload), "reply");
                summary.replies.push((query_id, payload));
                pending = pending.saturating_sub(1);
            }
            ClientEvent::QueryFailed { query_id, state } => {
                warn!(query_id, %state, "query ended without a reply");
                summary.failed_queries += 1;
                pending = pending.saturating_sub(1);
            }
        }

        if plan.exit_when_done && plan_sent && pending == 0 {
            break;
        }
    }

    sdkctl.disconnect();
    Ok(summary)
}

fn send_plan(
    sdkctl: &SdkCtlSocket,
    config: &HostConfig,
    plan: &Plan,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Result<(), SdkCtlError> {
    for text in &plan.messages {
        sdkctl.send_message(plan.message_type, text.as_bytes())?;
    }
    if let Some(text) = &plan.query {
        let events = events.clone();
        let query = sdkctl.build_and_send_query(
            config.service.query_type,
            text.as_bytes(),
            None,
            move |query, state| {
                let event = match state {
                    AsyncIoState::Succeeded => ClientEvent::Reply {
                        query_id: query.query_id(),
                        payload: query.response().to_vec(),
                    },
                    AsyncIoState::Failed | AsyncIoState::TimedOut | AsyncIoState::Cancelled => {
                        ClientEvent::QueryFailed {
                            query_id: query.query_id(),
                            state,
                        }
                    }
                    _ => return AsyncIoAction::Done,
                };
                let _ = events.send(event);
                AsyncIoAction::Done
            },
            Some(config.service.query_timeout()),
        )?;
        debug!(query_id = query.query_id(), "query sent");
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use sdkctl_core::sdkctl::port::{MSG_PORT_ENABLED, QUERY_HANDSHAKE};
    use sdkctl_core::{ByteOrder, Frame, SdkCtlCodec};
    use tokio::net::TcpListener;
    use tokio::task::LocalSet;
    use tokio_util::codec::Framed;

    /// One-connection device that answers the handshake with `code` and
    /// echoes everything afterwards.
    async fn device(code: i32) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, SdkCtlCodec::device());
            while let Some(Ok(frame)) = framed.next().await {
                let out = match frame {
                    Frame::Endianness(_) => continue,
                    Frame::Query {
                        query_id,
                        query_type: QUERY_HANDSHAKE,
                        ..
                    } => {
                        let mut reply = [0u8; 4];
                        ByteOrder::native().write_i32(&mut reply, code);
                        framed
                            .send(Frame::QueryReply {
                                query_id,
                                payload: Bytes::copy_from_slice(&reply),
                            })
                            .await
                            .unwrap();
                        Frame::Message {
                            msg_type: MSG_PORT_ENABLED,
                            payload: Bytes::new(),
                        }
                    }
                    Frame::Query {
                        query_id, payload, ..
                    } => Frame::QueryReply { query_id, payload },
                    other => other,
                };
                if framed.send(out).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    fn config(port: u16) -> HostConfig {
        let mut config = HostConfig::default();
        config.network.port = port;
        config.network.retry_timeout_ms = 50;
        config
    }

    #[tokio::test]
    async fn plan_is_echoed_back() {
        let port = device(0).await;
        let plan = Plan {
            messages: vec!["one".into(), "two".into()],
            message_type: 5,
            query: Some("rate".into()),
            exit_when_done: true,
        };
        let config = config(port);
        let summary = LocalSet::new()
            .run_until(tokio::time::timeout(
                std::time::Duration::from_secs(10),
                run(&config, plan),
            ))
            .await
            .expect("client did not finish")
            .unwrap();

        assert_eq!(
            summary.messages,
            vec![(5, b"one".to_vec()), (5, b"two".to_vec())]
        );
        assert_eq!(summary.replies.len(), 1);
        assert_eq!(summary.replies[0].1, b"rate".to_vec());
        assert_eq!(summary.failed_queries, 0);
    }

    #[tokio::test]
    async fn rejected_handshake_is_an_error() {
        let port = device(-1).await;
        let config = config(port);
        let result = LocalSet::new()
            .run_until(tokio::time::timeout(
                std::time::Duration::from_secs(10),
                run(&config, Plan::default()),
            ))
            .await
            .expect("client did not finish");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
