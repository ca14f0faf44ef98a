//! iproto codec: constants, MsgPack reader/writer, frame composition.

use base64::{engine::general_purpose::STANDARD, Engine};

use self::consts::{GREETING_SIZE, SALT_SIZE, VERSION_SIZE};
use crate::errors::DecodingError;

pub mod consts;
pub mod iproto;
pub mod reader;
pub mod writer;

/// Greeting message from server.
///
/// [Docs](https://www.tarantool.io/en/doc/latest/dev_guide/internals/box_protocol/#greeting-message).
#[derive(Clone, Debug)]
pub struct Greeting {
    /// Human-readable version banner (first line).
    pub server: String,
    /// Decoded salt; the first 20 bytes feed the auth scramble.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Size of the full message from server in bytes.
    pub const SIZE: usize = GREETING_SIZE;

    /// Decode a greeting from the first [`Self::SIZE`] bytes of `raw`.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodingError> {
        if raw.len() < Self::SIZE {
            return Err(DecodingError::new("short greeting"));
        }
        let server = String::from_utf8_lossy(&raw[..VERSION_SIZE])
            .trim_end_matches(['\n', ' ', '\0'])
            .to_owned();
        let salt_b64 = &raw[VERSION_SIZE..VERSION_SIZE + SALT_SIZE];
        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|e| DecodingError::new(format!("failed to decode salt from base64: {e}")))?;
        Ok(Self { server, salt })
    }
}

/// Hex dump with an optional `>`/`<` bracket around the byte at `pos`,
/// 16 bytes per line.
pub fn hex_dump(bytes: &[u8], pos: Option<usize>) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (i, byte) in bytes.iter().enumerate() {
        out.push_str(&format!("{byte:02x}"));
        let sep = match pos {
            Some(p) if i + 1 == p => '>',
            Some(p) if i == p => '<',
            _ => ' ',
        };
        out.push(sep);
        if (i + 1) % 16 == 0 {
            out.push('\n');
        } else if (i + 1) % 8 == 0 {
            out.push(' ');
        }
    }
    out
}
