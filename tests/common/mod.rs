//! Shared test harness: an in-process mock iproto server plus a miniature
//! reactor that drives the connection the way an embedding event loop
//! would (poll readiness, forward read/write, drain notifications, tick).

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use tarantool_evio::buffer::ByteBuf;
use tarantool_evio::codec::reader::MpReader;
use tarantool_evio::codec::writer::MpWriter;
use tarantool_evio::{Connection, ErrorKind, WatchMode};

pub const TEST_SALT: [u8; 32] = [
    0x1a, 0x24, 0x61, 0xc1, 0xe1, 0x7c, 0xdf, 0x67, 0x74, 0x70, 0x42, 0x93, 0x3d, 0xc5, 0xef,
    0x8c, 0xc3, 0x3a, 0xab, 0xc2, 0xf9, 0xe3, 0x84, 0x63, 0xe4, 0x44, 0x2f, 0xb7, 0x5c, 0x77,
    0xb1, 0xf0,
];

/// Mock Tarantool accepting a fixed number of connections, each handled by
/// the supplied script.
pub struct MockServer {
    addr: SocketAddr,
}

impl MockServer {
    pub fn spawn(accepts: usize, script: impl Fn(usize, TcpStream) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        thread::spawn(move || {
            for i in 0..accepts {
                match listener.accept() {
                    Ok((stream, _)) => script(i, stream),
                    Err(_) => return,
                }
            }
        });
        Self { addr }
    }

    pub fn connection_string(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn connection_string_for(&self, user: &str, password: &str) -> String {
        format!("{user}:{password}@127.0.0.1:{}", self.addr.port())
    }
}

/// Write the 128-byte greeting: banner line, base64 salt line, padding.
pub fn send_greeting(stream: &mut TcpStream, salt: &[u8; 32]) {
    let mut greeting = vec![b' '; 128];
    let banner = b"Tarantool 2.11.0 (Binary) 12cd26b5-61c6-4bc8-acc0-3271392fea75";
    greeting[..banner.len()].copy_from_slice(banner);
    greeting[63] = b'\n';
    let encoded = STANDARD.encode(salt);
    assert_eq!(encoded.len(), 44);
    greeting[64..108].copy_from_slice(encoded.as_bytes());
    greeting[127] = b'\n';
    stream.write_all(&greeting).expect("send greeting");
}

/// Read one length-prefixed iproto message; returns header+body MsgPack.
pub fn read_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; 5];
    stream.read_exact(&mut prefix)?;
    assert_eq!(prefix[0], 0xce, "iproto length prefix");
    let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message)?;
    Ok(message)
}

/// Request type and sync from a request's header map.
pub fn parse_request_header(message: &[u8]) -> (u64, u64) {
    let mut r = MpReader::new(message);
    let header = r.map().expect("request header map");
    let request_type: u64 = header.key(0x00).unwrap().read().unwrap();
    let sync: u64 = header.key(0x01).unwrap().read().unwrap();
    (request_type, sync)
}

/// Frame a reply: `0xce` length prefix + header map + supplied body bytes.
pub fn frame_reply(code: u32, sync: u64, schema_version: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = ByteBuf::default();
    {
        let mut w = MpWriter::new(&mut buf);
        w.begin_map(3).unwrap();
        w.write_uint(0x00).unwrap();
        let code = if code != 0 { 0x8000 | code as u64 } else { 0 };
        w.write_uint(code).unwrap();
        w.write_uint(0x01).unwrap();
        w.write_u64_fixed(sync).unwrap();
        w.write_uint(0x05).unwrap();
        w.write_uint(schema_version as u64).unwrap();
        w.finalize().unwrap();
    }
    let mut out = vec![0xce];
    out.extend_from_slice(&((buf.len() + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(buf.as_slice());
    out.extend_from_slice(body);
    out
}

/// Empty body map.
pub fn empty_body() -> Vec<u8> {
    vec![0x80]
}

/// Body map `{ERROR_24: message}`.
pub fn error_body(message: &str) -> Vec<u8> {
    let mut buf = ByteBuf::default();
    let mut w = MpWriter::new(&mut buf);
    w.begin_map(1).unwrap();
    w.write_uint(0x31).unwrap();
    w.write_str(message).unwrap();
    w.finalize().unwrap();
    buf.as_slice().to_vec()
}

/// Server-side check of a chap-sha1 AUTH request body.
pub fn verify_auth(message: &[u8], user: &str, password: &str, salt: &[u8]) {
    let mut r = MpReader::new(message);
    let _header = r.map().expect("auth header");
    let body = r.map().expect("auth body");
    let got_user: String = body.key(0x23).unwrap().read().unwrap();
    assert_eq!(got_user, user);
    let tuple = body.key(0x21).unwrap().array().unwrap();
    assert_eq!(tuple.len(), 2);
    let proto: String = tuple.get(0).unwrap().read().unwrap();
    assert_eq!(proto, "chap-sha1");
    let scramble = tuple.get(1).unwrap().read_bin().unwrap().to_vec();

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);
    let mut h = Sha1::new();
    h.update(&salt[..20]);
    h.update(hash2);
    let step = h.finalize();
    let expected: Vec<u8> = hash1.iter().zip(step.iter()).map(|(a, b)| a ^ b).collect();
    assert_eq!(scramble, expected, "scramble mismatch");
}

/// Render a panic payload from a mock-server thread into a failure string.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "mock server panicked".to_owned())
}

pub fn hex(s: &str) -> Vec<u8> {
    let clean: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    (0..clean.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).unwrap())
        .collect()
}

/// Install a watch-mode recorder on the connection.
pub fn wire_watch(conn: &mut Connection) -> Rc<Cell<WatchMode>> {
    let watch = Rc::new(Cell::new(WatchMode::None));
    let recorder = Rc::clone(&watch);
    conn.on_socket_watcher_request(move |mode| recorder.set(mode));
    watch
}

/// Install an error recorder on the connection.
pub type ErrorLog = Rc<RefCell<Vec<(String, ErrorKind, u32)>>>;

pub fn wire_errors(conn: &mut Connection) -> ErrorLog {
    let log: ErrorLog = Rc::new(RefCell::new(Vec::new()));
    let recorder = Rc::clone(&log);
    conn.on_error(move |message, kind, db_code| {
        recorder
            .borrow_mut()
            .push((message.to_owned(), kind, db_code));
    });
    log
}

fn poll_fd(fd: RawFd, mode: WatchMode, timeout_ms: i32) -> (bool, bool) {
    let mut events: libc::c_short = 0;
    if matches!(mode, WatchMode::Read | WatchMode::ReadWrite) {
        events |= libc::POLLIN;
    }
    if matches!(mode, WatchMode::Write | WatchMode::ReadWrite) {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if n <= 0 {
        return (false, false);
    }
    let readable = pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
    let writable = pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0;
    (readable, writable)
}

/// Drive the connection until `done` or the real-time `timeout` expires.
///
/// `tick_every` compresses the 1-Hz timer: when set, `tick_1sec()` fires
/// every such real-time interval, so reconnect countdowns play out quickly.
pub fn drive(
    conn: &mut Connection,
    watch: &Rc<Cell<WatchMode>>,
    timeout: Duration,
    tick_every: Option<Duration>,
    mut done: impl FnMut(&mut Connection) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut last_tick = Instant::now();
    loop {
        conn.acquire_notifications();
        if done(conn) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        if let Some(every) = tick_every {
            if last_tick.elapsed() >= every {
                conn.tick_1sec();
                last_tick = Instant::now();
            }
        }

        match (conn.socket_handle(), watch.get()) {
            (Some(fd), mode) if mode != WatchMode::None => {
                let (readable, writable) = poll_fd(fd, mode, 10);
                if readable {
                    conn.read();
                }
                if writable {
                    conn.write();
                }
            }
            _ => thread::sleep(Duration::from_millis(2)),
        }
    }
}
