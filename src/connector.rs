//! Request/response correlation on top of [`Connection`].
//!
//! The connector keys every composed request by its sync id and dispatches
//! each framed response to the matching one-shot handler. On disconnect it
//! fabricates an error reply for every outstanding request, so callers
//! always hear back exactly once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::warn;

use crate::buffer::ByteBuf;
use crate::codec::consts::{header, response, RESPONSE_CODE_MASK};
use crate::codec::iproto::IprotoWriter;
use crate::codec::reader::{MapReader, MpReader};
use crate::codec::writer::MpWriter;
use crate::connection::Connection;
use crate::errors::{DecodingError, EncodingError, ErrorKind};

/// Error code carried by synthetic disconnect replies.
const DISCONNECTED_CODE: u64 = 77;

/// Parsed response header handed to result handlers.
#[derive(Copy, Clone, Debug)]
pub struct ResponseHeader {
    pub sync: u64,
    /// Database error code (header CODE with the error flag masked off);
    /// 0 for success.
    pub code: u64,
}

impl ResponseHeader {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

/// One-shot handler for a correlated response.
pub type ResultHandler =
    Box<dyn for<'a> FnOnce(&ResponseHeader, MapReader<'a>) -> anyhow::Result<()>>;

/// Closure composing request arguments through the MsgPack writer.
pub type ArgsFn<'f> = &'f mut dyn FnMut(&mut MpWriter<'_>) -> Result<(), EncodingError>;

struct DispatchState {
    handlers: HashMap<u64, ResultHandler>,
    dispatching: bool,
    /// `close()` requested mid-dispatch: (reconnect_soon).
    pending_close: Option<bool>,
    user_closed: Option<Box<dyn FnMut(&mut Connection)>>,
}

/// Correlated Tarantool client: a connection plus a sync-to-handler map.
pub struct Connector {
    conn: Connection,
    state: Rc<RefCell<DispatchState>>,
}

impl Connector {
    pub fn new(connection_string: impl Into<String>) -> Self {
        let state = Rc::new(RefCell::new(DispatchState {
            handlers: HashMap::new(),
            dispatching: false,
            pending_close: None,
            user_closed: None,
        }));

        let mut conn = Connection::new(connection_string);

        let dispatch_state = Rc::clone(&state);
        conn.on_response(move |conn, input| {
            dispatch(&dispatch_state, conn, input);
            Ok(())
        });

        let closed_state = Rc::clone(&state);
        conn.on_closed(move |conn| {
            fan_out_disconnect(&closed_state, conn);
            Ok(())
        });

        Self { conn, state }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Raw access to the connection for wiring it into an event loop.
    ///
    /// Prefer [`close`](Self::close) over `Connection::close` here: the
    /// connector defers closing while a dispatch loop is running.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn open(&mut self) {
        self.conn.open();
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_opened()
    }

    /// Close, optionally arming a quick reconnect. Deferred until the end
    /// of the dispatch loop when called from a result handler.
    pub fn close(&mut self, reconnect_soon: bool) {
        if self.state.borrow().dispatching {
            self.state.borrow_mut().pending_close = Some(reconnect_soon);
            return;
        }
        self.conn
            .close_with(true, if reconnect_soon { 1 } else { 0 });
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().handlers.len()
    }

    /// Set the user disconnect handler, fired after synthetic replies.
    pub fn on_closed(&mut self, handler: impl FnMut(&mut Connection) + 'static) -> &mut Self {
        self.state.borrow_mut().user_closed = Some(Box::new(handler));
        self
    }

    /// CALL: `function_name(args...)`.
    ///
    /// `args` composes the argument values; the connector wraps them into
    /// the TUPLE array. The handler fires exactly once: with the server's
    /// reply, or with a synthetic disconnect reply (code 77).
    pub fn call(
        &mut self,
        function_name: &str,
        mut args: impl FnMut(&mut MpWriter<'_>) -> Result<(), EncodingError>,
        handler: impl for<'a> FnOnce(&ResponseHeader, MapReader<'a>) -> anyhow::Result<()> + 'static,
    ) -> Result<u64, EncodingError> {
        self.compose(handler, |writer, raw, count| {
            writer.begin_call(function_name, count)?;
            writer.writer().write_raw(raw, count)?;
            writer.finalize_all()
        }, &mut args)
    }

    /// EVAL: run a Lua expression with arguments.
    pub fn eval(
        &mut self,
        expression: &str,
        mut args: impl FnMut(&mut MpWriter<'_>) -> Result<(), EncodingError>,
        handler: impl for<'a> FnOnce(&ResponseHeader, MapReader<'a>) -> anyhow::Result<()> + 'static,
    ) -> Result<u64, EncodingError> {
        self.compose(handler, |writer, raw, count| {
            writer.begin_eval(expression, count)?;
            writer.writer().write_raw(raw, count)?;
            writer.finalize_all()
        }, &mut args)
    }

    /// PING round-trip.
    pub fn ping(
        &mut self,
        handler: impl for<'a> FnOnce(&ResponseHeader, MapReader<'a>) -> anyhow::Result<()> + 'static,
    ) -> Result<u64, EncodingError> {
        let sync = self.conn.request_writer().encode_ping_request()?;
        self.register(sync, Box::new(handler));
        self.conn.flush();
        Ok(sync)
    }

    fn compose(
        &mut self,
        handler: impl for<'a> FnOnce(&ResponseHeader, MapReader<'a>) -> anyhow::Result<()> + 'static,
        encode: impl FnOnce(&mut IprotoWriter<'_>, &[u8], u32) -> Result<(), EncodingError>,
        args: ArgsFn<'_>,
    ) -> Result<u64, EncodingError> {
        // encode arguments aside first so their count is known up front
        let mut scratch = ByteBuf::default();
        let count = {
            let mut w = MpWriter::new(&mut scratch);
            args(&mut w)?;
            w.finalize_all()?;
            count_items(scratch.as_slice())?
        };

        // roll back on failure so no partial message is left for flush()
        let mark = self.conn.output_buffer().len();
        let mut writer = self.conn.request_writer();
        if let Err(e) = encode(&mut writer, scratch.as_slice(), count) {
            self.conn.output_buffer().resize(mark);
            return Err(e);
        }
        let sync = self.conn.last_request_id();
        self.register(sync, Box::new(handler));
        self.conn.flush();
        Ok(sync)
    }

    fn register(&mut self, sync: u64, handler: ResultHandler) {
        let prev = self.state.borrow_mut().handlers.insert(sync, handler);
        debug_assert!(prev.is_none(), "sync {sync} reused while outstanding");
    }
}

fn count_items(raw: &[u8]) -> Result<u32, EncodingError> {
    let mut r = MpReader::new(raw);
    let mut count = 0u32;
    while r.has_next() {
        r.skip()
            .map_err(|e| EncodingError::MessagePack(anyhow::anyhow!("{e}")))?;
        count += 1;
    }
    Ok(count)
}

/// Walk a response bunch and complete the matching requests.
fn dispatch(state: &Rc<RefCell<DispatchState>>, conn: &mut Connection, input: &mut ByteBuf) {
    state.borrow_mut().dispatching = true;

    let mut bunch = MpReader::new(input.as_slice());
    loop {
        match bunch.iproto_message() {
            Ok(Some(mut message)) => {
                match parse_response(&mut message) {
                    Ok((head, body)) => {
                        let handler = state.borrow_mut().handlers.remove(&head.sync);
                        match handler {
                            Some(handler) => {
                                if let Err(e) = handler(&head, body) {
                                    conn.handle_error(
                                        &format!("{e:#}"),
                                        ErrorKind::System,
                                        0,
                                    );
                                }
                            }
                            None => {
                                warn!("unknown sync {}", head.sync);
                                conn.handle_error(
                                    "unexpected response",
                                    ErrorKind::UnexpectedData,
                                    0,
                                );
                            }
                        }
                    }
                    Err(e) => conn.handle_error(&e.to_string(), ErrorKind::UnexpectedData, 0),
                }
            }
            Ok(None) => break,
            Err(e) => {
                conn.handle_error(&e.to_string(), ErrorKind::UnexpectedData, 0);
                break;
            }
        }
    }

    conn.input_processed();

    let pending = {
        let mut s = state.borrow_mut();
        s.dispatching = false;
        s.pending_close.take()
    };
    if let Some(reconnect_soon) = pending {
        conn.close_with(true, if reconnect_soon { 1 } else { 0 });
    }
}

fn parse_response<'a>(
    message: &mut MpReader<'a>,
) -> Result<(ResponseHeader, MapReader<'a>), DecodingError> {
    let head = message.map()?;
    let sync: u64 = head.key(header::SYNC as i64)?.read()?;
    let code: u64 = head.key(header::CODE as i64)?.read()?;
    let body = message.map()?;
    Ok((
        ResponseHeader {
            sync,
            code: code & RESPONSE_CODE_MASK,
        },
        body,
    ))
}

/// Complete every outstanding request with a synthetic disconnect reply,
/// then run the user's disconnect handler.
fn fan_out_disconnect(state: &Rc<RefCell<DispatchState>>, conn: &mut Connection) {
    let handlers: Vec<(u64, ResultHandler)> = state.borrow_mut().handlers.drain().collect();

    if !handlers.is_empty() {
        let mut body_buf = ByteBuf::default();
        let encoded = (|| {
            let mut w = MpWriter::new(&mut body_buf);
            w.begin_map(1)?;
            w.write_uint(response::ERROR_24 as u64)?;
            w.write_str("disconnected")?;
            w.finalize()
        })();
        // composing a one-pair static map cannot fail
        if let Err(e) = encoded {
            conn.handle_error(&e.to_string(), ErrorKind::System, 0);
            return;
        }

        for (sync, handler) in handlers {
            let head = ResponseHeader {
                sync,
                code: DISCONNECTED_CODE,
            };
            let body = match MpReader::new(body_buf.as_slice()).map() {
                Ok(body) => body,
                Err(e) => {
                    conn.handle_error(&e.to_string(), ErrorKind::System, 0);
                    return;
                }
            };
            if let Err(e) = handler(&head, body) {
                conn.handle_error(&format!("{e:#}"), ErrorKind::System, 0);
            }
        }
    }

    let user_closed = state.borrow_mut().user_closed.take();
    if let Some(mut cb) = user_closed {
        cb(conn);
        let mut s = state.borrow_mut();
        if s.user_closed.is_none() {
            s.user_closed = Some(cb);
        }
    }
}
