//! Session handshake: the byte-order flag, then a `QUERY_HANDSHAKE`
//! query carrying the service name.

use std::io;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::header::ByteOrder;
use crate::socket_io::AsyncSocketIo;

use super::port::{PortStatus, QUERY_HANDSHAKE};
use super::query::SdkCtlQuery;
use super::socket::SdkCtlSocket;

/// How long the service gets to take the flag and answer the query.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(3000);

pub(crate) fn start(sdkctl: &SdkCtlSocket) {
    let Some(socket) = sdkctl.async_socket() else {
        return;
    };
    let order = ByteOrder::native();
    debug!(service = %sdkctl.service_name(), ?order, "sending byte order");
    let weak = Rc::downgrade(&sdkctl.inner);
    socket.write_rel(
        vec![order.flag()],
        move |io, state| match weak.upgrade() {
            Some(inner) => on_flag_sent(&SdkCtlSocket::from_inner(inner), io, state),
            None => AsyncIoAction::Abort,
        },
        Some(HANDSHAKE_TIMEOUT),
    );
}

fn on_flag_sent(sdkctl: &SdkCtlSocket, io: &AsyncSocketIo, state: AsyncIoState) -> AsyncIoAction {
    match state {
        AsyncIoState::Succeeded => send_query(sdkctl),
        AsyncIoState::Failed | AsyncIoState::TimedOut => {
            warn!(service = %sdkctl.service_name(), %state, "byte order flag not sent");
            let kind = io.last_error().unwrap_or(io::ErrorKind::TimedOut);
            sdkctl.fail_session(kind);
        }
        AsyncIoState::Cancelled => debug!(service = %sdkctl.service_name(), "handshake cancelled"),
        _ => {}
    }
    AsyncIoAction::Done
}

fn send_query(sdkctl: &SdkCtlSocket) {
    let weak = Rc::downgrade(&sdkctl.inner);
    let sent = sdkctl.build_and_send_query(
        QUERY_HANDSHAKE,
        sdkctl.service_name().as_bytes(),
        None,
        move |query, state| match weak.upgrade() {
            Some(inner) => on_reply(&SdkCtlSocket::from_inner(inner), query, state),
            None => AsyncIoAction::Done,
        },
        Some(HANDSHAKE_TIMEOUT),
    );
    if let Err(e) = sent {
        warn!(service = %sdkctl.service_name(), error = %e, "handshake query not sent");
    }
}

fn on_reply(sdkctl: &SdkCtlSocket, query: &SdkCtlQuery, state: AsyncIoState) -> AsyncIoAction {
    match state {
        AsyncIoState::Succeeded => {
            let status = {
                let response = query.response();
                match response.get(..4) {
                    Some(code) => PortStatus::from_handshake_reply(ByteOrder::native().read_i32(code)),
                    None => PortStatus::HandshakeUnknownResponse,
                }
            };
            on_status(sdkctl, status);
        }
        AsyncIoState::Failed | AsyncIoState::TimedOut => {
            warn!(service = %sdkctl.service_name(), %state, "handshake query did not complete");
            sdkctl.fail_session(if state == AsyncIoState::TimedOut {
                io::ErrorKind::TimedOut
            } else {
                sdkctl.last_error().unwrap_or(io::ErrorKind::ConnectionReset)
            });
        }
        AsyncIoState::Cancelled => debug!(service = %sdkctl.service_name(), "handshake query cancelled"),
        _ => {}
    }
    AsyncIoAction::Done
}

fn on_status(sdkctl: &SdkCtlSocket, status: PortStatus) {
    if status.is_handshake_failure() {
        warn!(service = %sdkctl.service_name(), %status, "handshake rejected");
        sdkctl.disconnect_session();
        sdkctl.set_port_status(status);
        sdkctl.set_error(io::ErrorKind::ConnectionRefused);
        sdkctl.notify_socket_connection(AsyncIoState::Failed);
        return;
    }
    info!(service = %sdkctl.service_name(), %status, "handshake complete");
    sdkctl.set_port_status(status);
    sdkctl.notify_port(status);
}
