//! Device-side service loop.
//!
//! Each accepted host gets its own task and a [`Framed`] stream over
//! [`SdkCtlCodec::device`]. The first byte fixes the byte order; from
//! there on every packet is decoded in that order and every reply is
//! encoded in it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use sdkctl_core::sdkctl::port::{
    HANDSHAKE_RESP_CONNECTED, HANDSHAKE_RESP_DUP, HANDSHAKE_RESP_NOPORT,
    HANDSHAKE_RESP_QUERY_UNKNOWN, MSG_PORT_DISABLED, MSG_PORT_ENABLED, QUERY_HANDSHAKE,
};
use sdkctl_core::{Frame, SdkCtlCodec, SdkCtlError};

use crate::config::DeviceConfig;

type HostStream = Framed<TcpStream, SdkCtlCodec>;

// ── DeviceService ────────────────────────────────────────────────

/// The mock SDK controller service.
///
/// Hosts connect over TCP, hand over their byte order and claim one of
/// the configured services through the handshake query. A service can
/// be claimed by one host at a time.
pub struct DeviceService {
    config: DeviceConfig,
    live: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicBool>,
}

impl DeviceService {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the accept loop and every open connection when
    /// set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), SdkCtlError> {
        let addr = format!(
            "{}:{}",
            self.config.network.bind_address, self.config.network.listen_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("SDK controller device listening on {addr}");
        self.serve(listener).await
    }

    /// Accept hosts on `listener` until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SdkCtlError> {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = wait_for_stop(&self.running) => break,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            info!("host connected from {peer}");

            let connection = Connection {
                peer,
                names: self.config.services.names.iter().cloned().collect(),
                enable_on_connect: self.config.services.enable_on_connect,
                live: Arc::clone(&self.live),
                running: Arc::clone(&self.running),
                service: None,
            };
            tokio::spawn(connection.run(stream));
        }

        self.running.store(false, Ordering::SeqCst);
        info!("SDK controller device stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Services currently claimed by a host.
    pub async fn live_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.lock().await.iter().cloned().collect();
        names.sort();
        names
    }
}

// ── Connection ───────────────────────────────────────────────────

struct Connection {
    peer: SocketAddr,
    names: HashSet<String>,
    enable_on_connect: bool,
    live: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicBool>,
    /// The service this host claimed, once the handshake succeeded.
    service: Option<String>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) {
        let mut framed = Framed::new(stream, SdkCtlCodec::device());
        let result = self.serve(&mut framed).await;

        if let Some(name) = self.service.take() {
            if self.enable_on_connect {
                // Best effort; the host may already be gone.
                let _ = framed
                    .send(Frame::Message {
                        msg_type: MSG_PORT_DISABLED,
                        payload: Bytes::new(),
                    })
                    .await;
            }
            self.live.lock().await.remove(&name);
            debug!(peer = %self.peer, service = %name, "service released");
        }
        match result {
            Ok(()) => info!("host {} disconnected", self.peer),
            Err(e) => warn!("host {} dropped: {e}", self.peer),
        }
    }

    async fn serve(&mut self, framed: &mut HostStream) -> Result<(), SdkCtlError> {
        loop {
            let next = tokio::select! {
                next = framed.next() => next,
                _ = wait_for_stop(&self.running) => return Ok(()),
            };
            match next {
                Some(frame) => self.on_frame(framed, frame?).await?,
                None => return Ok(()),
            }
        }
    }

    async fn on_frame(&mut self, framed: &mut HostStream, frame: Frame) -> Result<(), SdkCtlError> {
        match frame {
            Frame::Endianness(flag) => {
                debug!(peer = %self.peer, flag, "byte order negotiated");
            }
            Frame::Query {
                query_id,
                query_type: QUERY_HANDSHAKE,
                payload,
            } => {
                let code = self.handshake(&payload).await;
                reply(framed, query_id, code).await?;
                if code == HANDSHAKE_RESP_CONNECTED && self.enable_on_connect {
                    framed
                        .send(Frame::Message {
                            msg_type: MSG_PORT_ENABLED,
                            payload: Bytes::new(),
                        })
                        .await?;
                }
            }
            Frame::Query {
                query_id,
                query_type,
                payload,
            } => {
                if self.service.is_none() {
                    warn!(peer = %self.peer, query_type, "query before handshake");
                    return reply(framed, query_id, HANDSHAKE_RESP_QUERY_UNKNOWN).await;
                }
                trace!(query_id, query_type, len = payload.len(), "query answered");
                framed.send(Frame::QueryReply { query_id, payload }).await?;
            }
            Frame::Message { msg_type, payload } => {
                if self.service.is_none() {
                    warn!(peer = %self.peer, msg_type, "message before handshake dropped");
                    return Ok(());
                }
                trace!(msg_type, len = payload.len(), "message echoed");
                framed.send(Frame::Message { msg_type, payload }).await?;
            }
            Frame::QueryReply { query_id, .. } => {
                warn!(peer = %self.peer, query_id, "unexpected reply from host");
            }
        }
        Ok(())
    }

    /// Claim the requested service and return the handshake reply code.
    async fn handshake(&mut self, payload: &[u8]) -> i32 {
        if self.service.is_some() {
            return HANDSHAKE_RESP_DUP;
        }
        let name = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .to_string();
        if !self.names.contains(&name) {
            info!(peer = %self.peer, service = %name, "no such service");
            return HANDSHAKE_RESP_NOPORT;
        }
        if !self.live.lock().await.insert(name.clone()) {
            info!(peer = %self.peer, service = %name, "service already claimed");
            return HANDSHAKE_RESP_DUP;
        }
        info!(peer = %self.peer, service = %name, "service claimed");
        self.service = Some(name);
        HANDSHAKE_RESP_CONNECTED
    }
}

/// Answer `query_id` with a single integer in the host's byte order.
async fn reply(framed: &mut HostStream, query_id: i32, code: i32) -> Result<(), SdkCtlError> {
    let order = framed
        .codec()
        .byte_order()
        .ok_or(SdkCtlError::ProtocolViolation("byte order not negotiated"))?;
    let mut payload = [0u8; 4];
    order.write_i32(&mut payload, code);
    framed
        .send(Frame::QueryReply {
            query_id,
            payload: Bytes::copy_from_slice(&payload),
        })
        .await
}

/// Resolves when `running` becomes false.
async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sdkctl_core::ByteOrder;
    use std::time::Duration;

    type Client = Framed<TcpStream, SdkCtlCodec>;

    async fn start() -> (SocketAddr, Arc<AtomicBool>, Arc<Mutex<HashSet<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = DeviceService::new(DeviceConfig::default());
        let stop = service.stop_handle();
        let live = Arc::clone(&service.live);
        tokio::spawn(async move { service.serve(listener).await });
        (addr, stop, live)
    }

    async fn client(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, SdkCtlCodec::host());
        framed
            .send(Frame::Endianness(ByteOrder::native().flag()))
            .await
            .unwrap();
        framed
    }

    async fn next(framed: &mut Client) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("no frame in time")
            .expect("stream closed")
            .unwrap()
    }

    async fn handshake(framed: &mut Client, service: &str) -> i32 {
        framed
            .send(Frame::Query {
                query_id: 1,
                query_type: QUERY_HANDSHAKE,
                payload: Bytes::copy_from_slice(service.as_bytes()),
            })
            .await
            .unwrap();
        match next(framed).await {
            Frame::QueryReply { query_id: 1, payload } => ByteOrder::native().read_i32(&payload),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn service_creates_stopped() {
        let svc = DeviceService::new(DeviceConfig::default());
        assert!(!svc.is_running());
        svc.stop_handle().store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn handshake_enables_the_port() {
        let (addr, stop, _) = start().await;
        let mut host = client(addr).await;

        assert_eq!(handshake(&mut host, "sensors").await, HANDSHAKE_RESP_CONNECTED);
        assert_eq!(
            next(&mut host).await,
            Frame::Message {
                msg_type: MSG_PORT_ENABLED,
                payload: Bytes::new(),
            }
        );
        stop.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn unknown_service_has_no_port() {
        let (addr, stop, _) = start().await;
        let mut host = client(addr).await;
        assert_eq!(handshake(&mut host, "gps").await, HANDSHAKE_RESP_NOPORT);
        stop.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn second_host_is_a_duplicate_until_the_first_leaves() {
        let (addr, stop, live) = start().await;
        let mut first = client(addr).await;
        assert_eq!(handshake(&mut first, "multi-touch").await, HANDSHAKE_RESP_CONNECTED);

        let mut second = client(addr).await;
        assert_eq!(handshake(&mut second, "multi-touch").await, HANDSHAKE_RESP_DUP);

        drop(first);
        for _ in 0..50 {
            if live.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(live.lock().await.is_empty());

        let mut third = client(addr).await;
        assert_eq!(handshake(&mut third, "multi-touch").await, HANDSHAKE_RESP_CONNECTED);
        stop.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn query_before_handshake_is_unknown() {
        let (addr, stop, _) = start().await;
        let mut host = client(addr).await;
        host.send(Frame::Query {
            query_id: 9,
            query_type: 3,
            payload: Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();
        match next(&mut host).await {
            Frame::QueryReply { query_id: 9, payload } => {
                assert_eq!(ByteOrder::native().read_i32(&payload), HANDSHAKE_RESP_QUERY_UNKNOWN)
            }
            other => panic!("unexpected frame {other:?}"),
        }
        stop.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn messages_and_queries_are_echoed() {
        let (addr, stop, _) = start().await;
        let mut host = client(addr).await;
        assert_eq!(handshake(&mut host, "sensors").await, HANDSHAKE_RESP_CONNECTED);
        let _enabled = next(&mut host).await;

        host.send(Frame::Message {
            msg_type: 7,
            payload: Bytes::from_static(b"ping"),
        })
        .await
        .unwrap();
        assert_eq!(
            next(&mut host).await,
            Frame::Message {
                msg_type: 7,
                payload: Bytes::from_static(b"ping"),
            }
        );

        host.send(Frame::Query {
            query_id: 2,
            query_type: 1,
            payload: Bytes::from_static(b"rate"),
        })
        .await
        .unwrap();
        assert_eq!(
            next(&mut host).await,
            Frame::QueryReply {
                query_id: 2,
                payload: Bytes::from_static(b"rate"),
            }
        );
        stop.store(false, Ordering::SeqCst);
    }
}
