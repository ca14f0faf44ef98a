//! Event-loop-agnostic Tarantool iproto connector.
//!
//! The core is a single-connection, non-blocking state machine: any reactor
//! can drive it by watching the socket handle and forwarding readiness to
//! [`Connection::read`] / [`Connection::write`], ticking
//! [`Connection::tick_1sec`] once a second, and calling
//! [`Connection::acquire_notifications`] when the connection asks for a
//! wake-up. On top of that, [`Connector`] correlates requests with
//! responses by sync id.
//!
//! ```no_run
//! use tarantool_evio::Connector;
//!
//! let mut client = Connector::new("guest@localhost:3301");
//! client.connection_mut().on_opened(|conn| {
//!     println!("connected to {:?}", conn.connection_string_parts());
//!     Ok(())
//! });
//! client.open();
//! // hand client.connection().socket_handle() to your event loop and
//! // forward readiness to read()/write()
//! ```

pub use rmpv::Value;

pub use self::{
    buffer::ByteBuf,
    builder::ConnectionBuilder,
    codec::consts::{Feature, ProtoId},
    codec::Greeting,
    conn_string::ConnStringParts,
    connection::{Connection, ConnectionState, WatchMode},
    connector::{Connector, ResponseHeader},
    errors::{DecodingError, EncodingError, ErrorKind},
};

pub mod buffer;
mod builder;
// exported so custom connectors can reuse the reader/writer/frame layer
pub mod codec;
pub mod conn_string;
mod connection;
mod connector;
mod errors;
