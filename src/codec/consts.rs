//! iproto protocol constants.
//!
//! See details [here](https://github.com/tarantool/tarantool/blob/master/src/box/iproto_constants.h).

/// Greeting geometry: 128 bytes total, 64-byte version banner, then a
/// 44-byte base64 salt whose first 20 decoded bytes feed the scramble.
pub const GREETING_SIZE: usize = 128;
pub const VERSION_SIZE: usize = 64;
pub const SALT_SIZE: usize = 44;
pub const SCRAMBLE_SIZE: usize = 20;

/// Request/response header map keys.
pub mod header {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_ID: u8 = 0x05;
}

/// Request body map keys.
pub mod body {
    pub const SPACE: u8 = 0x10;
    pub const INDEX: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPRESSION: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const VERSION: u8 = 0x54;
    pub const FEATURES: u8 = 0x55;
    pub const AUTH_TYPE: u8 = 0x5b;
}

/// Response body map keys.
pub mod response {
    pub const DATA: u8 = 0x30;
    /// Old style error (string).
    pub const ERROR_24: u8 = 0x31;
    /// New style error (ext-typed error object).
    pub const ERROR: u8 = 0x52;
}

/// Bit 15 of the header CODE marks an error response; the low 15 bits are
/// the database error code.
pub const RESPONSE_CODE_ERROR_FLAG: u64 = 0x8000;
pub const RESPONSE_CODE_MASK: u64 = 0x7fff;

/// Request type codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Select = 0x01,
    Insert = 0x02,
    Replace = 0x03,
    Update = 0x04,
    Delete = 0x05,
    /// CALL request wrapping its result into `[tuple, tuple, ...]`.
    Call16 = 0x06,
    Auth = 0x07,
    Eval = 0x08,
    Upsert = 0x09,
    /// CALL request returning arbitrary MessagePack.
    Call = 0x0a,
    Execute = 0x0b,
    Nop = 0x0c,
    Prepare = 0x0d,
    Ping = 0x40,
    /// Protocol feature negotiation.
    ProtoId = 0x49,
    Watch = 0x4a,
    Unwatch = 0x4b,
    Event = 0x4c,
    WatchOnce = 0x4d,
}

/// MsgPack extension type ids used by Tarantool.
///
/// [Docs](https://www.tarantool.io/en/doc/latest/dev_guide/internals/msgpack_extensions/).
pub mod ext {
    pub const DECIMAL: i8 = 1;
    pub const UUID: i8 = 2;
    pub const ERROR: i8 = 3;
    pub const DATETIME: i8 = 4;
    pub const INTERVAL: i8 = 6;
}

/// Error-stack item keys inside the error extension.
pub mod error_field {
    pub const TYPE: u8 = 0x00;
    pub const FILE: u8 = 0x01;
    pub const LINE: u8 = 0x02;
    pub const MESSAGE: u8 = 0x03;
    pub const ERRNO: u8 = 0x04;
    pub const CODE: u8 = 0x05;
    pub const FIELDS: u8 = 0x06;
}

/// iproto features negotiated via [`RequestType::ProtoId`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Feature {
    Streams = 0,
    Transactions = 1,
    /// proto 2+
    ErrorExtension = 2,
    /// proto 3+
    Watchers = 3,
    Pagination = 4,
}

/// Desired protocol version and feature set for the PROTO_ID request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtoId {
    pub version: u64,
    pub features: Vec<Feature>,
    pub auth: String,
}

impl ProtoId {
    pub fn new(features: impl Into<Vec<Feature>>) -> Self {
        Self {
            version: 0,
            features: features.into(),
            auth: String::new(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = auth.into();
        self
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}
