//! iproto frame composition.
//!
//! Every message is a 5-byte length prefix (`0xce` + big-endian u32),
//! a header map and a body map. The prefix is written up front with zero
//! length and patched on finalize, so requests can be composed streaming
//! into the connection's output buffer.

use sha1::{Digest, Sha1};
use tracing::trace;

use super::consts::{body, header, ProtoId, RequestType, SCRAMBLE_SIZE};
use super::writer::{ContainerKind, MpWriter};
use crate::buffer::ByteBuf;
use crate::errors::EncodingError;

/// Default authentication protocol.
pub const AUTH_PROTO_CHAP_SHA1: &str = "chap-sha1";

/// Composes iproto messages into a buffer, tracking request ids.
///
/// Borrows the connection's sync counter so every started request consumes
/// the next id; the caller reads `last_request_id()` off the connection to
/// correlate the reply.
pub struct IprotoWriter<'a> {
    w: MpWriter<'a>,
    request_id: &'a mut u64,
}

impl<'a> IprotoWriter<'a> {
    pub fn new(buf: &'a mut ByteBuf, request_id: &'a mut u64) -> Self {
        Self {
            w: MpWriter::new(buf),
            request_id,
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = *self.request_id;
        *self.request_id += 1;
        id
    }

    /// Access the underlying MsgPack writer, e.g. to append call arguments.
    pub fn writer(&mut self) -> &mut MpWriter<'a> {
        &mut self.w
    }

    /// Initiate a message: finalize anything unfinished and reserve the
    /// 5-byte length prefix.
    pub fn start_message(&mut self) -> Result<(), EncodingError> {
        self.finalize_all()?;

        // keep ~1 KiB headroom so typical requests never reallocate mid-way
        let buf = self.w.buffer();
        if buf.available() < 1024 {
            buf.reserve(buf.capacity() + 1024);
        }

        self.w.push_container(ContainerKind::Frame, u32::MAX);
        self.w
            .buffer()
            .extend_from_slice(&[0xce, 0x00, 0x00, 0x00, 0x00]);
        Ok(())
    }

    /// Finalize the innermost container; for the message frame this patches
    /// the length prefix with the body size.
    pub fn finalize(&mut self) -> Result<(), EncodingError> {
        self.w.finalize()
    }

    /// Finalize all open containers including the message frame.
    pub fn finalize_all(&mut self) -> Result<(), EncodingError> {
        self.w.finalize_all()
    }

    /// Start a request: length prefix plus the two-pair header map.
    pub fn encode_request_header(&mut self, request_type: RequestType) -> Result<u64, EncodingError> {
        self.start_message()?;
        let sync = self.next_request_id();
        trace!("composing {:?} request, sync {}", request_type, sync);
        self.w.begin_map(2)?;
        self.w.write_uint(header::CODE as u64)?;
        self.w.write_uint(request_type as u64)?;
        self.w.write_uint(header::SYNC as u64)?;
        self.w.write_u64_fixed(sync)?;
        self.w.finalize()?; // header map, keeps the frame open
        Ok(sync)
    }

    /// Start a response: length prefix plus a three-pair header map.
    ///
    /// Mostly a testing aid: lets a mock peer frame replies the same way
    /// requests are framed.
    pub fn encode_response_header(
        &mut self,
        error_code: u32,
        schema_version: u64,
    ) -> Result<(), EncodingError> {
        let code = if error_code != 0 {
            0x8000 | error_code as u64
        } else {
            0
        };
        self.start_message()?;
        let sync = self.next_request_id();
        self.w.begin_map(3)?;
        self.w.write_uint(header::CODE as u64)?;
        self.w.write_uint(code)?;
        self.w.write_uint(header::SYNC as u64)?;
        self.w.write_u64_fixed(sync)?;
        self.w.write_uint(header::SCHEMA_ID as u64)?;
        self.w.write_uint(schema_version)?;
        self.w.finalize()
    }

    /// Complete AUTH request for the user against the greeting salt.
    pub fn encode_auth_request(
        &mut self,
        user: &str,
        password: &str,
        salt: &[u8],
    ) -> Result<u64, EncodingError> {
        let sync = self.encode_request_header(RequestType::Auth)?;
        self.w.begin_map(2)?;
        self.w.write_uint(body::USER_NAME as u64)?;
        self.w.write_str(user)?;
        self.w.write_uint(body::TUPLE as u64)?;
        self.w.begin_array(2)?;
        self.w.write_str(AUTH_PROTO_CHAP_SHA1)?;
        let scramble = scramble(password, salt);
        self.w.write_bin(&scramble)?;
        self.finalize_all()?;
        Ok(sync)
    }

    /// Complete PROTO_ID feature-negotiation request.
    pub fn encode_id_request(&mut self, proto: &ProtoId) -> Result<u64, EncodingError> {
        let sync = self.encode_request_header(RequestType::ProtoId)?;
        let pairs = 1
            + u32::from(proto.version != 0)
            + u32::from(!proto.auth.is_empty());
        self.w.begin_map(pairs)?;
        if proto.version != 0 {
            self.w.write_uint(body::VERSION as u64)?;
            self.w.write_uint(proto.version)?;
        }
        self.w.write_uint(body::FEATURES as u64)?;
        self.w.begin_array(proto.features.len() as u32)?;
        for feature in &proto.features {
            self.w.write_uint(*feature as u64)?;
        }
        self.w.finalize()?;
        if !proto.auth.is_empty() {
            self.w.write_uint(body::AUTH_TYPE as u64)?;
            self.w.write_str(&proto.auth)?;
        }
        self.finalize_all()?;
        Ok(sync)
    }

    /// Complete PING request (empty body map).
    pub fn encode_ping_request(&mut self) -> Result<u64, EncodingError> {
        let sync = self.encode_request_header(RequestType::Ping)?;
        self.w.begin_map(0)?;
        self.finalize_all()?;
        Ok(sync)
    }

    /// Initiate a CALL request and open its argument array.
    ///
    /// The caller appends arguments through [`writer`](Self::writer) and
    /// closes the message with [`finalize_all`](Self::finalize_all); a void
    /// call just finalizes right away.
    pub fn begin_call(&mut self, function_name: &str, max_args: u32) -> Result<u64, EncodingError> {
        let sync = self.encode_request_header(RequestType::Call)?;
        self.w.begin_map(2)?;
        self.w.write_uint(body::FUNCTION_NAME as u64)?;
        self.w.write_str(function_name)?;
        self.w.write_uint(body::TUPLE as u64)?;
        self.w.begin_array(max_args)?;
        Ok(sync)
    }

    /// Initiate an EVAL request and open its argument array.
    pub fn begin_eval(&mut self, expression: &str, max_args: u32) -> Result<u64, EncodingError> {
        let sync = self.encode_request_header(RequestType::Eval)?;
        self.w.begin_map(2)?;
        self.w.write_uint(body::EXPRESSION as u64)?;
        self.w.write_str(expression)?;
        self.w.write_uint(body::TUPLE as u64)?;
        self.w.begin_array(max_args)?;
        Ok(sync)
    }
}

/// chap-sha1 scramble:
///
/// ```text
/// hash1       = SHA1(password)
/// hash2       = SHA1(hash1)
/// step        = SHA1(salt[..20] || hash2)
/// scramble[i] = hash1[i] ^ step[i]
/// ```
pub fn scramble(password: &str, salt: &[u8]) -> [u8; SCRAMBLE_SIZE] {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE.min(salt.len())]);
    hasher.update(hash2);
    let step = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ step[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::consts::Feature;
    use crate::codec::reader::MpReader;

    fn frame(f: impl FnOnce(&mut IprotoWriter<'_>)) -> Vec<u8> {
        let mut buf = ByteBuf::default();
        let mut sync = 0;
        let mut w = IprotoWriter::new(&mut buf, &mut sync);
        f(&mut w);
        buf.as_slice().to_vec()
    }

    #[test]
    fn ping_request_bytes() {
        let bytes = frame(|w| { w.encode_ping_request().unwrap(); });
        let mut expected = vec![0xce, 0x00, 0x00, 0x00, 0x0e];
        expected.extend_from_slice(&[0x82, 0x00, 0x40, 0x01, 0xcf]);
        expected.extend_from_slice(&0u64.to_be_bytes());
        expected.push(0x80);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn sync_increments_per_request() {
        let mut buf = ByteBuf::default();
        let mut sync = 0;
        let mut w = IprotoWriter::new(&mut buf, &mut sync);
        w.encode_ping_request().unwrap();
        w.encode_ping_request().unwrap();
        assert_eq!(sync, 2);

        let mut bunch = MpReader::new(buf.as_slice());
        for expected_sync in 0..2u64 {
            let mut msg = bunch.iproto_message().unwrap().unwrap();
            let header = msg.map().unwrap();
            assert_eq!(header.key(0x01).unwrap().read::<u64>().unwrap(), expected_sync);
        }
    }

    #[test]
    fn auth_request_layout() {
        let salt = [7u8; 32];
        let bytes = frame(|w| { w.encode_auth_request("alice", "secret", &salt).unwrap(); });

        let mut bunch = MpReader::new(&bytes);
        let mut msg = bunch.iproto_message().unwrap().unwrap();
        let header = msg.map().unwrap();
        assert_eq!(
            header.key(0x00).unwrap().read::<u64>().unwrap(),
            RequestType::Auth as u64
        );
        let body = msg.map().unwrap();
        assert_eq!(
            body.key(body::USER_NAME as i64).unwrap().read::<String>().unwrap(),
            "alice"
        );
        let tuple = body.key(body::TUPLE as i64).unwrap().array().unwrap();
        assert_eq!(tuple.len(), 2);
        assert_eq!(
            tuple.get(0).unwrap().read::<String>().unwrap(),
            AUTH_PROTO_CHAP_SHA1
        );
    }

    #[test]
    fn scramble_formula() {
        // L3: recompute the definition independently
        let password = "secret";
        let salt: Vec<u8> = (0..32).collect();

        let hash1 = Sha1::digest(password.as_bytes());
        let hash2 = Sha1::digest(hash1);
        let mut h = Sha1::new();
        h.update(&salt[..20]);
        h.update(hash2);
        let step = h.finalize();
        let expected: Vec<u8> = hash1.iter().zip(step.iter()).map(|(a, b)| a ^ b).collect();

        assert_eq!(scramble(password, &salt).to_vec(), expected);

        // empty password is valid
        let _ = scramble("", &salt);
    }

    #[test]
    fn id_request_layout() {
        let proto = ProtoId::new(vec![Feature::Streams, Feature::ErrorExtension])
            .with_version(3)
            .with_auth(AUTH_PROTO_CHAP_SHA1);
        let bytes = frame(|w| { w.encode_id_request(&proto).unwrap(); });

        let mut bunch = MpReader::new(&bytes);
        let mut msg = bunch.iproto_message().unwrap().unwrap();
        let header = msg.map().unwrap();
        assert_eq!(
            header.key(0x00).unwrap().read::<u64>().unwrap(),
            RequestType::ProtoId as u64
        );
        let id_body = msg.map().unwrap();
        assert_eq!(id_body.len(), 3);
        assert_eq!(
            id_body.key(body::VERSION as i64).unwrap().read::<u64>().unwrap(),
            3
        );
        assert_eq!(
            id_body.key(body::FEATURES as i64).unwrap().read::<Vec<u8>>().unwrap(),
            vec![0, 2]
        );
        assert_eq!(
            id_body.key(body::AUTH_TYPE as i64).unwrap().read::<String>().unwrap(),
            AUTH_PROTO_CHAP_SHA1
        );
    }

    #[test]
    fn call_with_args_and_trailing_frame_fixup() {
        let bytes = frame(|w| {
            w.begin_call("station_name", 2).unwrap();
            w.writer().write_bool(false).unwrap();
            w.writer().write_uint(9).unwrap();
            w.finalize_all().unwrap();
        });

        let mut bunch = MpReader::new(&bytes);
        let mut msg = bunch.iproto_message().unwrap().unwrap();
        let _header = msg.map().unwrap();
        let call_body = msg.map().unwrap();
        assert_eq!(
            call_body
                .key(body::FUNCTION_NAME as i64)
                .unwrap()
                .read::<String>()
                .unwrap(),
            "station_name"
        );
        let args = call_body.key(body::TUPLE as i64).unwrap().array().unwrap();
        assert_eq!(args.len(), 2);
        assert!(!bunch.has_next());
    }

    #[test]
    fn eval_shrinks_declared_args() {
        let bytes = frame(|w| {
            w.begin_eval("return 1", 5).unwrap();
            w.writer().write_uint(1).unwrap();
            w.finalize_all().unwrap();
        });
        let mut bunch = MpReader::new(&bytes);
        let mut msg = bunch.iproto_message().unwrap().unwrap();
        let _header = msg.map().unwrap();
        let eval_body = msg.map().unwrap();
        let args = eval_body.key(body::TUPLE as i64).unwrap().array().unwrap();
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn response_header_error_flag() {
        let bytes = frame(|w| {
            w.encode_response_header(47, 155).unwrap();
            w.writer().begin_map(0).unwrap();
            w.finalize_all().unwrap();
        });
        let mut bunch = MpReader::new(&bytes);
        let mut msg = bunch.iproto_message().unwrap().unwrap();
        let header = msg.map().unwrap();
        assert_eq!(header.key(0x00).unwrap().read::<u64>().unwrap(), 0x802f);
        assert_eq!(header.key(0x05).unwrap().read::<u64>().unwrap(), 155);
    }
}
