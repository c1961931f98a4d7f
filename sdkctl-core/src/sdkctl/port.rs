//! Port status of the remote service and the reserved message and query
//! types that drive it.

use std::fmt;

/// Query type of the handshake query.
pub const QUERY_HANDSHAKE: i32 = -1;

/// Unsolicited messages the service sends about its port.
pub const MSG_PORT_CONNECTED: i32 = -1;
pub const MSG_PORT_DISCONNECTED: i32 = -2;
pub const MSG_PORT_ENABLED: i32 = -3;
pub const MSG_PORT_DISABLED: i32 = -4;

/// Handshake reply codes.
pub const HANDSHAKE_RESP_CONNECTED: i32 = 0;
pub const HANDSHAKE_RESP_NOPORT: i32 = 1;
pub const HANDSHAKE_RESP_DUP: i32 = -1;
pub const HANDSHAKE_RESP_QUERY_UNKNOWN: i32 = -2;

/// State of the service endpoint behind the socket, as opposed to the
/// state of the socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortStatus {
    PortDisconnected,
    PortConnected,
    PortEnabled,
    PortDisabled,
    /// Handshake accepted by the service.
    HandshakeConnected,
    /// Handshake reached the device but no service listens on the port.
    HandshakeNoPort,
    /// Another client is already connected to the service.
    HandshakeDup,
    /// The service did not understand the handshake query.
    HandshakeUnknownQuery,
    /// The handshake reply could not be interpreted.
    HandshakeUnknownResponse,
}

impl PortStatus {
    /// Map a handshake reply code.
    pub fn from_handshake_reply(code: i32) -> Self {
        match code {
            HANDSHAKE_RESP_CONNECTED => PortStatus::HandshakeConnected,
            HANDSHAKE_RESP_NOPORT => PortStatus::HandshakeNoPort,
            HANDSHAKE_RESP_DUP => PortStatus::HandshakeDup,
            HANDSHAKE_RESP_QUERY_UNKNOWN => PortStatus::HandshakeUnknownQuery,
            _ => PortStatus::HandshakeUnknownResponse,
        }
    }

    /// The status a reserved message type announces, if it is one.
    pub fn from_port_message(msg_type: i32) -> Option<Self> {
        match msg_type {
            MSG_PORT_CONNECTED => Some(PortStatus::PortConnected),
            MSG_PORT_DISCONNECTED => Some(PortStatus::PortDisconnected),
            MSG_PORT_ENABLED => Some(PortStatus::PortEnabled),
            MSG_PORT_DISABLED => Some(PortStatus::PortDisabled),
            _ => None,
        }
    }

    /// The reserved message type announcing this status.
    pub fn port_message(self) -> Option<i32> {
        match self {
            PortStatus::PortConnected => Some(MSG_PORT_CONNECTED),
            PortStatus::PortDisconnected => Some(MSG_PORT_DISCONNECTED),
            PortStatus::PortEnabled => Some(MSG_PORT_ENABLED),
            PortStatus::PortDisabled => Some(MSG_PORT_DISABLED),
            _ => None,
        }
    }

    /// `true` for handshake outcomes that end the session.
    pub fn is_handshake_failure(self) -> bool {
        matches!(
            self,
            PortStatus::HandshakeDup
                | PortStatus::HandshakeUnknownQuery
                | PortStatus::HandshakeUnknownResponse
        )
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortStatus::PortDisconnected => "PORT_DISCONNECTED",
            PortStatus::PortConnected => "PORT_CONNECTED",
            PortStatus::PortEnabled => "PORT_ENABLED",
            PortStatus::PortDisabled => "PORT_DISABLED",
            PortStatus::HandshakeConnected => "HANDSHAKE_CONNECTED",
            PortStatus::HandshakeNoPort => "HANDSHAKE_NO_PORT",
            PortStatus::HandshakeDup => "HANDSHAKE_DUP",
            PortStatus::HandshakeUnknownQuery => "HANDSHAKE_UNKNOWN_QUERY",
            PortStatus::HandshakeUnknownResponse => "HANDSHAKE_UNKNOWN_RESPONSE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_reply_mapping() {
        assert_eq!(PortStatus::from_handshake_reply(0), PortStatus::HandshakeConnected);
        assert_eq!(PortStatus::from_handshake_reply(1), PortStatus::HandshakeNoPort);
        assert_eq!(PortStatus::from_handshake_reply(-1), PortStatus::HandshakeDup);
        assert_eq!(PortStatus::from_handshake_reply(-2), PortStatus::HandshakeUnknownQuery);
        assert_eq!(PortStatus::from_handshake_reply(7), PortStatus::HandshakeUnknownResponse);
    }

    #[test]
    fn handshake_failures() {
        assert!(PortStatus::HandshakeDup.is_handshake_failure());
        assert!(PortStatus::HandshakeUnknownResponse.is_handshake_failure());
        assert!(!PortStatus::HandshakeNoPort.is_handshake_failure());
        assert!(!PortStatus::PortEnabled.is_handshake_failure());
    }

    #[test]
    fn port_messages_roundtrip() {
        for msg in [MSG_PORT_CONNECTED, MSG_PORT_DISCONNECTED, MSG_PORT_ENABLED, MSG_PORT_DISABLED] {
            let status = PortStatus::from_port_message(msg).unwrap();
            assert_eq!(status.port_message(), Some(msg));
        }
        assert!(PortStatus::from_port_message(0).is_none());
        assert!(PortStatus::from_port_message(12).is_none());
    }
}
