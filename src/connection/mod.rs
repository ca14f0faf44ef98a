//! Connection state machine.
//!
//! A [`Connection`] is a single non-blocking socket driven from outside:
//! the embedding event loop calls [`read`](Connection::read) and
//! [`write`](Connection::write) on socket readiness, [`tick_1sec`]
//! (Connection::tick_1sec) once a second, and
//! [`acquire_notifications`](Connection::acquire_notifications) when the
//! notify-request callback asks for a wake-up. Everything else — connecting,
//! the greeting/auth handshake, framing, reconnecting — happens inside.
//!
//! Outbound data goes through a two-buffer pipeline: callers append whole
//! requests into the output buffer and publish them with
//! [`flush`](Connection::flush); the send buffer is what the socket drains.
//! The send buffer is never reallocated while bytes are in flight, so the
//! write cursor stays a plain offset into it.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use socket2::{SockAddr, Socket};
use tracing::{debug, trace, warn};

use crate::buffer::ByteBuf;
use crate::codec::consts::{header, response, ProtoId, GREETING_SIZE, RESPONSE_CODE_MASK};
use crate::codec::iproto::IprotoWriter;
use crate::codec::reader::MpReader;
use crate::codec::Greeting;
use crate::conn_string::{self, ConnStringParts};
use crate::errors::ErrorKind;

pub(crate) mod notify;
mod socket;

use self::notify::{NotificationHandler, NotificationQueue, NotifyRequestFn};
use self::socket::GENERAL_TIMEOUT_SECS;

/// Connection lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ResolvingAddress,
    Connecting,
    Authenticating,
    Connected,
}

/// Socket readiness the connection wants the embedding loop to watch for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchMode {
    None,
    Read,
    Write,
    ReadWrite,
}

/// Fallible lifecycle callback (`on_opened` / `on_closed`).
pub type LifecycleCallback = Box<dyn FnMut(&mut Connection) -> anyhow::Result<()>>;
/// Error report callback: message, internal kind, db error code.
pub type ErrorCallback = Box<dyn FnMut(&str, ErrorKind, u32)>;
/// Response callback; owns the input buffer until `input_processed()`.
pub type ResponseCallback = Box<dyn FnMut(&mut Connection, &mut ByteBuf) -> anyhow::Result<()>>;
/// Idle callback, fired after `idle_timeout` seconds without I/O.
pub type IdleCallback = Box<dyn FnMut(&mut Connection)>;
/// Socket watch request callback.
pub type WatchCallback = Box<dyn FnMut(WatchMode)>;

/// Tarantool connector's network layer.
pub struct Connection {
    current_cs: String,
    cs_parts: ConnStringParts,
    /// Kept verbatim for later re-authentication of the same session.
    greeting: Vec<u8>,
    required_proto: Option<ProtoId>,

    state: ConnectionState,
    socket: Option<Socket>,
    prev_watch_mode: WatchMode,

    // inbound
    receive_buffer: ByteBuf,
    input_buffer: ByteBuf,
    caller_idle: bool,
    last_complete_head: usize,
    detected_response_size: usize,

    // outbound
    output_buffer: ByteBuf,
    send_buffer: ByteBuf,
    next_to_send: usize,
    uncorked_size: usize,
    is_corked: bool,
    last_write_time: Option<Instant>,

    request_id: u64,
    /// Handshake replies (ID/AUTH syncs) still expected before Connected.
    handshake_pending: Vec<u64>,

    /// Configured timeout; `autoreconnect_timeout` snaps back to it on
    /// every explicit open.
    default_autoreconnect_timeout: u32,
    autoreconnect_timeout: u32,
    /// -1 disarmed, otherwise seconds elapsed towards the timeout.
    autoreconnect_ticks: i64,
    idle_timeout: Option<u32>,
    idle_ticks: u32,

    notifications: Arc<NotificationQueue>,
    notify_request: Option<NotifyRequestFn>,
    resolver: Option<JoinHandle<()>>,

    connected_cb: Option<LifecycleCallback>,
    disconnected_cb: Option<LifecycleCallback>,
    error_cb: Option<ErrorCallback>,
    response_cb: Option<ResponseCallback>,
    idle_cb: Option<IdleCallback>,
    watch_cb: Option<WatchCallback>,
}

impl Connection {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            current_cs: connection_string.into(),
            cs_parts: ConnStringParts::default(),
            greeting: Vec::new(),
            required_proto: None,
            state: ConnectionState::Disconnected,
            socket: None,
            prev_watch_mode: WatchMode::None,
            receive_buffer: ByteBuf::with_capacity(64 * 1024),
            input_buffer: ByteBuf::default(),
            caller_idle: true,
            last_complete_head: 0,
            detected_response_size: 0,
            output_buffer: ByteBuf::default(),
            send_buffer: ByteBuf::default(),
            next_to_send: 0,
            uncorked_size: 0,
            is_corked: false,
            last_write_time: None,
            request_id: 0,
            handshake_pending: Vec::new(),
            default_autoreconnect_timeout: GENERAL_TIMEOUT_SECS as u32,
            autoreconnect_timeout: GENERAL_TIMEOUT_SECS as u32,
            autoreconnect_ticks: -1,
            idle_timeout: None,
            idle_ticks: 0,
            notifications: Arc::new(NotificationQueue::default()),
            notify_request: None,
            resolver: None,
            connected_cb: None,
            disconnected_cb: None,
            error_cb: None,
            response_cb: None,
            idle_cb: None,
            watch_cb: None,
        }
    }

    // ---------------------------------------------------------------- state

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_opened(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    pub fn greeting(&self) -> &[u8] {
        &self.greeting
    }

    pub fn socket_handle(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn connection_string_parts(&self) -> &ConnStringParts {
        &self.cs_parts
    }

    /// Buffer to put requests in; publish with [`flush`](Self::flush).
    pub fn output_buffer(&mut self) -> &mut ByteBuf {
        &mut self.output_buffer
    }

    /// iproto writer over the output buffer, consuming request ids.
    pub fn request_writer(&mut self) -> IprotoWriter<'_> {
        IprotoWriter::new(&mut self.output_buffer, &mut self.request_id)
    }

    pub fn last_request_id(&self) -> u64 {
        self.request_id.wrapping_sub(1)
    }

    pub fn next_request_id(&mut self) -> u64 {
        let id = self.request_id;
        self.request_id += 1;
        id
    }

    /// Unsent bytes: the in-flight remainder plus anything uncorked behind it.
    pub fn bytes_to_send(&self) -> usize {
        self.send_buffer.len() - self.next_to_send + self.uncorked_size
    }

    pub fn set_connection_string(
        &mut self,
        connection_string: impl Into<String>,
    ) -> anyhow::Result<()> {
        if self.state != ConnectionState::Disconnected {
            anyhow::bail!("unable to reset connection string on busy connection");
        }
        self.current_cs = connection_string.into();
        Ok(())
    }

    /// Request PROTO_ID negotiation between greeting and AUTH.
    pub fn set_required_proto(&mut self, proto: ProtoId) {
        self.required_proto = Some(proto);
    }

    pub fn set_autoreconnect_timeout(&mut self, seconds: u32) {
        self.default_autoreconnect_timeout = seconds.max(1);
        self.autoreconnect_timeout = seconds.max(1);
    }

    // ------------------------------------------------------------ callbacks

    /// Set successful connection handler.
    pub fn on_opened(
        &mut self,
        handler: impl FnMut(&mut Connection) -> anyhow::Result<()> + 'static,
    ) -> &mut Self {
        self.connected_cb = Some(Box::new(handler));
        self
    }

    /// Set disconnection handler.
    pub fn on_closed(
        &mut self,
        handler: impl FnMut(&mut Connection) -> anyhow::Result<()> + 'static,
    ) -> &mut Self {
        self.disconnected_cb = Some(Box::new(handler));
        self
    }

    /// Set error handler.
    pub fn on_error(&mut self, handler: impl FnMut(&str, ErrorKind, u32) + 'static) -> &mut Self {
        self.error_cb = Some(Box::new(handler));
        self
    }

    /// Set callback to pass response bunches to.
    pub fn on_response(
        &mut self,
        handler: impl FnMut(&mut Connection, &mut ByteBuf) -> anyhow::Result<()> + 'static,
    ) -> &mut Self {
        self.response_cb = Some(Box::new(handler));
        self
    }

    /// Fire the idle handler after `timeout_secs` of no I/O while connected.
    pub fn on_idle(
        &mut self,
        timeout_secs: u32,
        handler: impl FnMut(&mut Connection) + 'static,
    ) -> &mut Self {
        self.idle_timeout = Some(timeout_secs.max(1));
        self.idle_cb = Some(Box::new(handler));
        self
    }

    /// Set callback asking the external watcher for a socket state.
    pub fn on_socket_watcher_request(
        &mut self,
        handler: impl FnMut(WatchMode) + 'static,
    ) -> &mut Self {
        self.watch_cb = Some(Box::new(handler));
        self
    }

    /// Set callback asking the event loop to call
    /// [`acquire_notifications`](Self::acquire_notifications) from the I/O
    /// thread. Invoked from producer threads.
    pub fn on_notify_request(&mut self, handler: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.notify_request = Some(Arc::new(handler));
        self
    }

    pub(crate) fn handle_error(&mut self, message: &str, kind: ErrorKind, db_code: u32) {
        debug!("connection error ({kind:?}, db {db_code}): {message}");
        if let Some(mut cb) = self.error_cb.take() {
            cb(message, kind, db_code);
            if self.error_cb.is_none() {
                self.error_cb = Some(cb);
            }
        }
    }

    fn watch_socket(&mut self, mode: WatchMode) {
        self.prev_watch_mode = mode;
        if let Some(mut cb) = self.watch_cb.take() {
            cb(mode);
            if self.watch_cb.is_none() {
                self.watch_cb = Some(cb);
            }
        }
    }

    fn fire_connected(&mut self) {
        if let Some(mut cb) = self.connected_cb.take() {
            let result = cb(self);
            if self.connected_cb.is_none() {
                self.connected_cb = Some(cb);
            }
            if let Err(e) = result {
                self.handle_error(&format!("{e:#}"), ErrorKind::External, 0);
            }
        }
    }

    fn fire_disconnected(&mut self) {
        if let Some(mut cb) = self.disconnected_cb.take() {
            let result = cb(self);
            if self.disconnected_cb.is_none() {
                self.disconnected_cb = Some(cb);
            }
            if let Err(e) = result {
                self.handle_error(&format!("{e:#}"), ErrorKind::External, 0);
            }
        }
    }

    // -------------------------------------------------------------- opening

    /// Open the connection now.
    pub fn open(&mut self) {
        self.open_impl(0)
    }

    /// Arm the reconnect countdown to open after `delay_secs`.
    pub fn open_delayed(&mut self, delay_secs: u32) {
        self.open_impl(delay_secs)
    }

    fn open_impl(&mut self, delay_secs: u32) {
        if self.state == ConnectionState::Connected {
            return;
        }
        if self.state != ConnectionState::Disconnected {
            self.handle_error(
                "unable to connect, connection is busy",
                ErrorKind::BadCallSequence,
                0,
            );
            return;
        }

        if delay_secs > 0 {
            self.autoreconnect_ticks = 0;
            self.autoreconnect_timeout = delay_secs;
            return;
        }

        if let Some(resolver) = &self.resolver {
            if resolver.is_finished() {
                self.join_resolver();
            } else {
                self.handle_error(
                    "address resolver is still in progress",
                    ErrorKind::GetaddrInProgress,
                    0,
                );
                return;
            }
        }

        // reset a delay a previous open_delayed() or close() could have changed
        self.autoreconnect_timeout = self.default_autoreconnect_timeout;
        self.autoreconnect_ticks = -1;
        self.cs_parts = conn_string::parse(&self.current_cs);

        if !self.cs_parts.host.is_empty() {
            self.spawn_resolver();
        } else if !self.cs_parts.unix_path.is_empty() {
            self.open_unix();
        } else {
            self.handle_error("incorrect connection string", ErrorKind::InvalidParameter, 0);
        }
    }

    /// getaddrinfo has no portable cancellation, so it runs on its own
    /// thread and posts the outcome back through the notification queue.
    fn spawn_resolver(&mut self) {
        let host = self.cs_parts.host.clone();
        let port: u16 = match self.cs_parts.port.parse() {
            Ok(port) => port,
            Err(_) => {
                self.handle_error("incorrect connection string", ErrorKind::InvalidParameter, 0);
                return;
            }
        };
        debug!("resolving {host}:{port}");
        self.state = ConnectionState::ResolvingAddress;

        let queue = Arc::clone(&self.notifications);
        let notify = self.notify_request.clone();
        self.resolver = Some(std::thread::spawn(move || {
            let outcome = (host.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let handler: NotificationHandler = match outcome {
                Ok(addrs) => Box::new(move |conn: &mut Connection| {
                    conn.join_resolver();
                    conn.address_resolved(&addrs);
                }),
                Err(e) => {
                    let message = e.to_string();
                    Box::new(move |conn: &mut Connection| {
                        conn.join_resolver();
                        if conn.state != ConnectionState::ResolvingAddress {
                            return;
                        }
                        conn.state = ConnectionState::Disconnected;
                        conn.handle_error(&message, ErrorKind::Getaddr, 0);
                        // retry because the dns may get fixed
                        conn.reconnect_soon();
                    })
                }
            };
            queue.push(handler);
            if let Some(notify) = notify {
                notify();
            }
        }));
    }

    fn join_resolver(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.join();
        }
    }

    fn address_resolved(&mut self, addrs: &[std::net::SocketAddr]) {
        // close() during resolving prevents further connecting
        if self.state != ConnectionState::ResolvingAddress {
            return;
        }

        for addr in addrs {
            let sock = match socket::tcp(addr) {
                Ok(sock) => sock,
                Err(e) => {
                    self.handle_error(&e.to_string(), ErrorKind::System, 0);
                    continue;
                }
            };

            self.state = ConnectionState::Connecting;
            match socket::connect_start(&sock, &SockAddr::from(*addr)) {
                Ok(true) => {
                    trace!("connected to {addr} immediately");
                    self.socket = Some(sock);
                    self.watch_socket(WatchMode::Read); // wait for greeting
                    return;
                }
                Ok(false) => {
                    trace!("connect to {addr} in progress");
                    self.socket = Some(sock);
                    self.watch_socket(WatchMode::Write);
                    self.autoreconnect_ticks = 0;
                    return;
                }
                Err(e) => {
                    self.handle_error(&e.to_string(), ErrorKind::System, 0);
                    break;
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        self.reconnect_soon();
    }

    fn open_unix(&mut self) {
        let path = self.cs_parts.unix_path.clone();
        let addr = match SockAddr::unix(&path) {
            Ok(addr) => addr,
            Err(e) => {
                self.handle_error(&e.to_string(), ErrorKind::InvalidParameter, 0);
                return;
            }
        };
        let sock = match socket::unix() {
            Ok(sock) => sock,
            Err(e) => {
                self.handle_error(&e.to_string(), ErrorKind::System, 0);
                return;
            }
        };

        self.state = ConnectionState::Connecting;
        match socket::connect_start(&sock, &addr) {
            Ok(true) => {
                self.socket = Some(sock);
                self.watch_socket(WatchMode::Read); // wait for greeting
            }
            Ok(false) => {
                self.socket = Some(sock);
                self.watch_socket(WatchMode::Write);
                self.autoreconnect_ticks = 0;
            }
            Err(e) => {
                self.handle_error(&e.to_string(), ErrorKind::System, 0);
                self.close_with(false, 0);
                self.reconnect_soon();
            }
        }
    }

    // -------------------------------------------------------------- closing

    /// Close the connection, firing `on_closed` unless the connection never
    /// got past connecting.
    pub fn close(&mut self) {
        self.close_with(true, 0);
    }

    pub(crate) fn close_with(&mut self, fire_disconnect: bool, reconnect_delay_secs: u32) {
        let prev_state = self.state;
        self.greeting.clear();
        self.state = ConnectionState::Disconnected;
        self.request_id = 0;
        self.idle_ticks = 0;
        self.handshake_pending.clear();
        if reconnect_delay_secs > 0 {
            self.autoreconnect_ticks = 0;
            self.autoreconnect_timeout = reconnect_delay_secs;
        } else {
            self.autoreconnect_ticks = -1;
        }

        let Some(socket) = self.socket.take() else {
            return;
        };
        debug!("closing connection (prev state {prev_state:?})");
        self.watch_socket(WatchMode::None);
        drop(socket);

        // Clear all sending buffers. A caller must resume its work
        // according to application logic.
        self.output_buffer.clear();
        self.send_buffer.clear();
        self.next_to_send = 0;
        self.uncorked_size = 0;

        // remove partial response
        self.detected_response_size = 0;
        self.receive_buffer.resize(self.last_complete_head);

        if prev_state != ConnectionState::Connecting && fire_disconnect {
            self.fire_disconnected();
        }
    }

    fn reconnect_soon(&mut self) {
        self.autoreconnect_ticks = 0;
    }

    // ------------------------------------------------------------- corking

    /// Advisory flag for callers composing multi-request batches.
    pub fn cork(&mut self) {
        self.is_corked = true;
    }

    pub fn is_corked(&self) -> bool {
        self.is_corked
    }

    /// `flush()` plus allow further requests to go out right away.
    pub fn uncork(&mut self) {
        self.flush();
        self.is_corked = false;
    }

    /// Move accumulated requests to the send buffer if possible.
    ///
    /// The output buffer must hold only whole iproto messages at this
    /// point. Returns `true` if the data went to the send buffer (or there
    /// was nothing to move); `false` means a prior batch is still in flight
    /// and the data will be promoted when the send buffer drains.
    pub fn flush(&mut self) -> bool {
        if self.output_buffer.is_empty() {
            return true;
        }

        let bytes_not_sent = self.send_buffer.len() - self.next_to_send;
        if bytes_not_sent == 0 {
            self.send_buffer.clear();
            self.send_buffer.swap(&mut self.output_buffer);
            self.next_to_send = 0;
            self.uncorked_size = 0;
            self.write();
            return true;
        }

        self.uncorked_size = self.output_buffer.len();
        false
    }

    // ------------------------------------------------------------- reading

    /// Drain the socket; called by the watcher on ready-read.
    pub fn read(&mut self) {
        // some pollers may deliver a dummy event for a bad socket
        if self.socket.is_none() {
            return;
        }

        self.idle_ticks = 0;
        loop {
            if self.receive_buffer.available() < 1024 {
                let cap = self.receive_buffer.capacity();
                self.receive_buffer.reserve((cap + cap / 2).max(16 * 1024));
            }

            let result = self
                .socket
                .as_ref()
                .expect("checked above")
                .recv(self.receive_buffer.spare_capacity_mut());
            match result {
                Ok(0) => {
                    self.handle_error("connection closed by peer", ErrorKind::ClosedByPeer, 0);
                    self.close_with(true, 0);
                    self.reconnect_soon();
                    return;
                }
                Ok(n) => {
                    trace!("received {n} bytes");
                    // Safety: recv wrote n bytes into the spare capacity.
                    unsafe { self.receive_buffer.advance(n) };
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.handle_error(&e.to_string(), ErrorKind::System, 0);
                    self.close_with(true, 0);
                    self.reconnect_soon();
                    return;
                }
            }
        }

        if self.state == ConnectionState::Connecting {
            self.process_greeting();
            return;
        }

        self.process_receive_buffer();
    }

    fn process_greeting(&mut self) {
        if self.receive_buffer.len() < GREETING_SIZE {
            return; // continue to read
        }

        self.greeting = self.receive_buffer.as_slice()[..GREETING_SIZE].to_vec();
        let tail = self.receive_buffer.as_slice()[GREETING_SIZE..].to_vec();
        self.clear_receive_buffer();
        if !tail.is_empty() {
            self.receive_buffer.extend_from_slice(&tail);
        }
        debug!(
            "greeting received: {}",
            String::from_utf8_lossy(&self.greeting[..64]).trim_end()
        );

        let user = &self.cs_parts.user;
        let needs_auth =
            self.cs_parts.unix_path.is_empty() && !user.is_empty() && user != "guest";

        if !needs_auth && self.required_proto.is_none() {
            self.set_connected();
            return;
        }

        let salt = match Greeting::decode(&self.greeting) {
            Ok(greeting) => greeting.salt,
            Err(e) => {
                self.handle_error(&e.to_string(), ErrorKind::UnexpectedData, 0);
                self.close_with(false, 0);
                self.reconnect_soon();
                return;
            }
        };

        self.state = ConnectionState::Authenticating;

        // the buffer may be littered by a caller who ignored on_closed
        self.send_buffer.clear();
        self.next_to_send = 0;

        // compose the handshake directly into the send buffer,
        // skipping the output buffer
        let composed = (|| -> Result<Vec<u64>, crate::errors::EncodingError> {
            let mut pending = Vec::new();
            let mut writer = IprotoWriter::new(&mut self.send_buffer, &mut self.request_id);
            if let Some(proto) = &self.required_proto {
                pending.push(writer.encode_id_request(proto)?);
            }
            if needs_auth {
                pending.push(writer.encode_auth_request(
                    &self.cs_parts.user,
                    &self.cs_parts.password,
                    &salt,
                )?);
            }
            Ok(pending)
        })();
        match composed {
            Ok(pending) => {
                self.handshake_pending = pending;
                self.write();
            }
            Err(e) => {
                self.handle_error(&e.to_string(), ErrorKind::System, 0);
                self.close_with(false, 0);
                self.reconnect_soon();
            }
        }
    }

    fn set_connected(&mut self) {
        debug!("connection established");
        self.state = ConnectionState::Connected;
        self.autoreconnect_ticks = -1;
        self.fire_connected();
    }

    fn clear_receive_buffer(&mut self) {
        self.receive_buffer.clear();
        self.last_complete_head = 0;
        self.detected_response_size = 0;
    }

    /// Detect response verges and hand complete bunches over.
    fn process_receive_buffer(&mut self) {
        loop {
            let orphaned = self.receive_buffer.len() - self.last_complete_head;
            if self.detected_response_size == 0 && orphaned >= 5 {
                // length part of the standard tnt header
                let head = &self.receive_buffer.as_slice()[self.last_complete_head..];
                match MpReader::new(head).read::<u64>() {
                    Ok(len) => self.detected_response_size = len as usize + 5,
                    Err(_) => {
                        self.handle_error("incorrect iproto message", ErrorKind::UnexpectedData, 0);
                        self.receive_buffer.resize(self.last_complete_head);
                    }
                }
            }

            let orphaned = self.receive_buffer.len() - self.last_complete_head;
            if self.detected_response_size != 0 && orphaned >= self.detected_response_size {
                self.last_complete_head += self.detected_response_size;
                self.detected_response_size = 0;
                continue;
            }
            break;
        }

        if self.last_complete_head == 0 {
            return;
        }

        // automatic authentication is processed specially, in
        // contradistinction to a manual authentication request
        if self.state == ConnectionState::Authenticating {
            self.process_handshake_replies();
        } else if self.caller_idle {
            self.pass_response_to_caller();
        }
    }

    fn process_handshake_replies(&mut self) {
        enum Outcome {
            Done(Vec<u64>),
            Rejected { message: String, db_code: u32 },
            Malformed(String),
        }

        let outcome = (|| {
            let complete = &self.receive_buffer.as_slice()[..self.last_complete_head];
            let mut bunch = MpReader::new(complete);
            let mut done = Vec::new();
            while let Some(mut message) = bunch.iproto_message().map_err(|e| e.to_string())? {
                let head = message.map().map_err(|e| e.to_string())?;
                let code: u64 = head
                    .key(header::CODE as i64)
                    .and_then(|mut r| r.read())
                    .map_err(|e| e.to_string())?;
                let sync: u64 = head
                    .key(header::SYNC as i64)
                    .and_then(|mut r| r.read())
                    .map_err(|e| e.to_string())?;
                if code != 0 {
                    let db_code = (code & RESPONSE_CODE_MASK) as u32;
                    let body = message.map().map_err(|e| e.to_string())?;
                    let description = match body.find(response::ERROR_24 as i64) {
                        Ok(Some(mut r)) => r.read::<String>().map_err(|e| e.to_string())?,
                        _ => match body.find(response::ERROR as i64) {
                            Ok(Some(mut r)) => r.to_string().map_err(|e| e.to_string())?,
                            _ => "authentication failed".to_owned(),
                        },
                    };
                    return Ok(Outcome::Rejected {
                        message: description,
                        db_code,
                    });
                }
                done.push(sync);
            }
            Ok(Outcome::Done(done))
        })()
        .unwrap_or_else(Outcome::Malformed);

        match outcome {
            Outcome::Malformed(message) => {
                self.handle_error(&message, ErrorKind::UnexpectedData, 0);
                self.clear_receive_buffer();
                self.close_with(false, 0);
                self.reconnect_soon();
            }
            Outcome::Rejected { message, db_code } => {
                self.handle_error(&message, ErrorKind::Auth, db_code);
                self.clear_receive_buffer();
                // never reached Connected, so no disconnect callback
                self.close_with(false, 0);
                self.reconnect_soon();
            }
            Outcome::Done(done) => {
                self.handshake_pending.retain(|sync| !done.contains(sync));
                self.consume_complete_messages();
                if self.handshake_pending.is_empty() {
                    self.set_connected();
                }
            }
        }
    }

    /// Drop the consumed complete-message prefix, keeping the partial tail.
    fn consume_complete_messages(&mut self) {
        if self.last_complete_head == 0 {
            return;
        }
        let tail_len = self.receive_buffer.len() - self.last_complete_head;
        if tail_len > 0 {
            let head = self.last_complete_head;
            self.receive_buffer.as_mut_slice().copy_within(head.., 0);
        }
        self.receive_buffer.resize(tail_len);
        self.last_complete_head = 0;
    }

    fn pass_response_to_caller(&mut self) {
        if self.last_complete_head == 0 {
            return;
        }

        let orphaned = self.receive_buffer.len() - self.last_complete_head;
        self.input_buffer.clear();
        self.input_buffer.swap(&mut self.receive_buffer);
        if orphaned > 0 {
            // partial response: move it back for the next read cycle
            let head = self.last_complete_head;
            self.receive_buffer.resize(orphaned);
            self.receive_buffer
                .as_mut_slice()
                .copy_from_slice(&self.input_buffer.as_slice()[head..head + orphaned]);
            let keep = self.input_buffer.len() - orphaned;
            self.input_buffer.resize(keep);
        }
        self.last_complete_head = 0;

        if self.response_cb.is_some() {
            self.caller_idle = false;
            let mut cb = self.response_cb.take().expect("checked above");
            let mut input = std::mem::take(&mut self.input_buffer);
            let result = cb(self, &mut input);
            self.input_buffer = input;
            if self.response_cb.is_none() {
                self.response_cb = Some(cb);
            }
            if let Err(e) = result {
                self.handle_error(&format!("{e:#}"), ErrorKind::System, 0);
                self.input_processed();
            }
            // A caller processing data synchronously can never see nested
            // calls: the loop is stuck, no new data arrives meanwhile.
        } else {
            // wipe data that is not going to be processed
            warn!("response dropped: no response callback installed");
            self.input_buffer.clear();
        }
    }

    /// Notify the connection that the input buffer has been processed and
    /// may be reused from the connection's side.
    pub fn input_processed(&mut self) {
        self.caller_idle = true;
        self.pass_response_to_caller();
    }

    // ------------------------------------------------------------- writing

    /// Push unsent bytes to the socket; called by the watcher on
    /// ready-write and internally by `flush`.
    pub fn write(&mut self) {
        if self.state == ConnectionState::Connecting {
            let Some(sock) = self.socket.as_ref() else {
                return;
            };
            match sock.take_error() {
                Ok(None) => self.watch_socket(WatchMode::Read),
                Ok(Some(e)) | Err(e) => {
                    self.handle_error(&e.to_string(), ErrorKind::System, 0);
                    self.close_with(false, 0);
                    self.reconnect_soon();
                }
            }
            return;
        }

        if self.socket.is_none() {
            return;
        }

        self.idle_ticks = 0;
        let mut bytes_to_send = self.send_buffer.len() - self.next_to_send;

        while bytes_to_send > 0 {
            let chunk = &self.send_buffer.as_slice()[self.next_to_send..];
            let result = self
                .socket
                .as_ref()
                .expect("checked above")
                .send_with_flags(chunk, libc::MSG_NOSIGNAL);
            match result {
                Ok(n) => {
                    trace!("sent {n} of {bytes_to_send} bytes");
                    self.last_write_time = Some(Instant::now());
                    bytes_to_send -= n;
                    self.next_to_send += n;

                    // the send buffer is done, the output buffer has more
                    if bytes_to_send == 0 && self.uncorked_size > 0 {
                        self.send_buffer.clear();
                        self.send_buffer.swap(&mut self.output_buffer);
                        self.next_to_send = 0;
                        bytes_to_send = self.uncorked_size;
                        self.uncorked_size = 0;
                        if bytes_to_send < self.send_buffer.len() {
                            // the caller kept appending past the commit
                            // point: hold that tail for the next round
                            let tail =
                                self.send_buffer.as_slice()[bytes_to_send..].to_vec();
                            self.output_buffer.extend_from_slice(&tail);
                            self.send_buffer.resize(bytes_to_send);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.handle_error(&e.to_string(), ErrorKind::System, 0);
                    self.close_with(true, 0);
                    self.reconnect_soon();
                    return;
                }
            }
        }

        self.watch_socket(if bytes_to_send > 0 {
            WatchMode::ReadWrite
        } else {
            WatchMode::Read
        });
    }

    // --------------------------------------------------------------- timers

    /// Timeouts basis (low precision); call every second.
    pub fn tick_1sec(&mut self) {
        if self.autoreconnect_ticks >= 0 {
            self.autoreconnect_ticks += 1;
            if self.autoreconnect_ticks >= self.autoreconnect_timeout as i64 {
                if self.state == ConnectionState::Disconnected {
                    // waiting for reconnect
                    self.open();
                } else {
                    // still connecting
                    self.close_with(true, 0);
                    self.handle_error("timeout expired", ErrorKind::Timeout, 0);
                    self.reconnect_soon();
                }
            }
        } else if self.is_opened() {
            let stuck = self.uncorked_size > 0
                && self
                    .last_write_time
                    .map(|t| t.elapsed().as_secs() >= GENERAL_TIMEOUT_SECS)
                    .unwrap_or(true);
            if stuck {
                self.handle_error(
                    &format!(
                        "uncorked data is stuck (watch mode {:?}, {} bytes to send, {} uncorked)",
                        self.prev_watch_mode,
                        self.send_buffer.len() - self.next_to_send,
                        self.uncorked_size
                    ),
                    ErrorKind::UncorkedDataJam,
                    0,
                );
                self.flush();
            }

            if let Some(timeout) = self.idle_timeout {
                self.idle_ticks += 1;
                if self.idle_ticks >= timeout {
                    self.idle_ticks = 0;
                    if let Some(mut cb) = self.idle_cb.take() {
                        cb(self);
                        if self.idle_cb.is_none() {
                            self.idle_cb = Some(cb);
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------- cross-thread

    /// Thread-safe: queue a handler to run on the connection's thread and
    /// ask the event loop for a wake-up.
    pub fn push_handler(&self, handler: impl FnOnce(&mut Connection) + Send + 'static) {
        self.notifications.push(Box::new(handler));
        if let Some(notify) = &self.notify_request {
            notify();
        }
    }

    /// Run queued cross-thread handlers; call from the connection's thread
    /// when asked via the notify-request callback.
    pub fn acquire_notifications(&mut self) {
        for handler in self.notifications.drain() {
            handler(self);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_with(true, 0);
        self.join_resolver();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("target", &self.current_cs)
            .field("request_id", &self.request_id)
            .field("bytes_to_send", &self.bytes_to_send())
            .finish_non_exhaustive()
    }
}
