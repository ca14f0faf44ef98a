use crate::codec::consts::ProtoId;
use crate::connection::Connection;
use crate::connector::Connector;

/// Build a connection to Tarantool.
#[derive(Clone, Debug, Default)]
pub struct ConnectionBuilder {
    autoreconnect_timeout: Option<u32>,
    required_proto: Option<ProtoId>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time limit for connecting and the delay between reconnect
    /// attempts. By default 10 seconds.
    pub fn autoreconnect_timeout(&mut self, seconds: impl Into<Option<u32>>) -> &mut Self {
        self.autoreconnect_timeout = seconds.into();
        self
    }

    /// Request PROTO_ID feature negotiation during the handshake.
    pub fn required_proto(&mut self, proto: impl Into<Option<ProtoId>>) -> &mut Self {
        self.required_proto = proto.into();
        self
    }

    /// Create an idle connection for the given connection string; open it
    /// with [`Connection::open`] once wired into the event loop.
    pub fn build(&self, connection_string: impl Into<String>) -> Connection {
        let mut conn = Connection::new(connection_string);
        if let Some(seconds) = self.autoreconnect_timeout {
            conn.set_autoreconnect_timeout(seconds);
        }
        if let Some(proto) = self.required_proto.clone() {
            conn.set_required_proto(proto);
        }
        conn
    }

    /// Create a correlated [`Connector`] for the given connection string.
    pub fn build_connector(&self, connection_string: impl Into<String>) -> Connector {
        let mut connector = Connector::new(connection_string);
        if let Some(seconds) = self.autoreconnect_timeout {
            connector.connection_mut().set_autoreconnect_timeout(seconds);
        }
        if let Some(proto) = self.required_proto.clone() {
            connector.connection_mut().set_required_proto(proto);
        }
        connector
    }
}
