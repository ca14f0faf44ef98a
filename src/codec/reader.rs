//! Streaming MsgPack reader over a byte range.
//!
//! A [`MpReader`] wraps a half-open byte range with a running cursor. Typed
//! extraction goes through the [`Decode`] trait; containers hand out
//! sub-readers bounded to their content. Tarantool extension types
//! (decimal, uuid, datetime, interval, error) are recognized on read.

use std::collections::HashMap;
use std::hash::Hash;

use rmp::Marker;

use super::consts::ext;
use super::hex_dump;
use crate::errors::DecodingError;

/// Integer value of either sign, before width checking.
#[derive(Copy, Clone, Debug)]
enum Int {
    U(u64),
    I(i64),
}

/// Ext item header: type id and payload range.
#[derive(Copy, Clone, Debug)]
pub struct ExtHead {
    pub ext_type: i8,
    pub len: usize,
}

/// Streaming MsgPack decoder with a cursor.
#[derive(Clone, Debug)]
pub struct MpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Unconsumed part of the range.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Move the cursor back to the start of the range.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub(crate) fn err(&self, message: impl Into<String>) -> DecodingError {
        DecodingError::with_dump(message, hex_dump(self.buf, Some(self.pos)))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodingError> {
        if self.buf.len() - self.pos < n {
            return Err(self.err("read out of bounds"));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_byte(&mut self) -> Result<u8, DecodingError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn peek_marker(&self) -> Result<Marker, DecodingError> {
        match self.buf.get(self.pos) {
            Some(b) => Ok(Marker::from_u8(*b)),
            None => Err(self.err("read out of bounds")),
        }
    }

    fn read_marker(&mut self) -> Result<Marker, DecodingError> {
        Ok(Marker::from_u8(self.take_byte()?))
    }

    fn take_len(&mut self, width: usize) -> Result<usize, DecodingError> {
        let bytes = self.take(width)?;
        Ok(match width {
            1 => bytes[0] as usize,
            2 => u16::from_be_bytes([bytes[0], bytes[1]]) as usize,
            _ => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
        })
    }

    /// Validate and advance past one item (arrays and maps including all
    /// their elements).
    pub fn skip(&mut self) -> Result<(), DecodingError> {
        let mut pending = 1usize;
        while pending > 0 {
            pending -= 1;
            let marker = self.read_marker()?;
            match marker {
                Marker::FixPos(_)
                | Marker::FixNeg(_)
                | Marker::Null
                | Marker::True
                | Marker::False => {}
                Marker::U8 | Marker::I8 => drop(self.take(1)?),
                Marker::U16 | Marker::I16 => drop(self.take(2)?),
                Marker::U32 | Marker::I32 | Marker::F32 => drop(self.take(4)?),
                Marker::U64 | Marker::I64 | Marker::F64 => drop(self.take(8)?),
                Marker::FixStr(len) => drop(self.take(len as usize)?),
                Marker::Str8 | Marker::Bin8 => {
                    let len = self.take_len(1)?;
                    self.take(len)?;
                }
                Marker::Str16 | Marker::Bin16 => {
                    let len = self.take_len(2)?;
                    self.take(len)?;
                }
                Marker::Str32 | Marker::Bin32 => {
                    let len = self.take_len(4)?;
                    self.take(len)?;
                }
                Marker::FixArray(n) => pending += n as usize,
                Marker::Array16 => pending += self.take_len(2)?,
                Marker::Array32 => pending += self.take_len(4)?,
                Marker::FixMap(n) => pending += 2 * n as usize,
                Marker::Map16 => pending += 2 * self.take_len(2)?,
                Marker::Map32 => pending += 2 * self.take_len(4)?,
                Marker::FixExt1 => drop(self.take(2)?),
                Marker::FixExt2 => drop(self.take(3)?),
                Marker::FixExt4 => drop(self.take(5)?),
                Marker::FixExt8 => drop(self.take(9)?),
                Marker::FixExt16 => drop(self.take(17)?),
                Marker::Ext8 => {
                    let len = self.take_len(1)?;
                    self.take(1 + len)?;
                }
                Marker::Ext16 => {
                    let len = self.take_len(2)?;
                    self.take(1 + len)?;
                }
                Marker::Ext32 => {
                    let len = self.take_len(4)?;
                    self.take(1 + len)?;
                }
                Marker::Reserved => return Err(self.err("invalid messagepack")),
            }
        }
        Ok(())
    }

    /// Typed extraction through [`Decode`].
    pub fn read<T: Decode<'a>>(&mut self) -> Result<T, DecodingError> {
        T::decode(self)
    }

    /// Like [`read`](Self::read), but absent or nil input yields `default`.
    pub fn read_or<T: Decode<'a>>(&mut self, default: T) -> Result<T, DecodingError> {
        if !self.has_next() {
            return Ok(default);
        }
        if matches!(self.peek_marker()?, Marker::Null) {
            self.skip()?;
            return Ok(default);
        }
        self.read()
    }

    fn read_int(&mut self) -> Result<Int, DecodingError> {
        let marker = self.read_marker()?;
        Ok(match marker {
            Marker::FixPos(v) => Int::U(v as u64),
            Marker::FixNeg(v) => Int::I(v as i64),
            Marker::U8 => Int::U(self.take(1)?[0] as u64),
            Marker::U16 => {
                let b = self.take(2)?;
                Int::U(u16::from_be_bytes([b[0], b[1]]) as u64)
            }
            Marker::U32 => {
                let b = self.take(4)?;
                Int::U(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64)
            }
            Marker::U64 => {
                let b = self.take(8)?;
                Int::U(u64::from_be_bytes(b.try_into().expect("length checked")))
            }
            Marker::I8 => Int::I(self.take(1)?[0] as i8 as i64),
            Marker::I16 => {
                let b = self.take(2)?;
                Int::I(i16::from_be_bytes([b[0], b[1]]) as i64)
            }
            Marker::I32 => {
                let b = self.take(4)?;
                Int::I(i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64)
            }
            Marker::I64 => {
                let b = self.take(8)?;
                Int::I(i64::from_be_bytes(b.try_into().expect("length checked")))
            }
            other => {
                self.pos -= 1;
                return Err(self.err(format!("integer expected, got {other:?}")));
            }
        })
    }

    fn read_str_slice(&mut self) -> Result<&'a [u8], DecodingError> {
        let marker = self.read_marker()?;
        let len = match marker {
            Marker::FixStr(n) => n as usize,
            Marker::Str8 => self.take_len(1)?,
            Marker::Str16 => self.take_len(2)?,
            Marker::Str32 => self.take_len(4)?,
            other => {
                self.pos -= 1;
                return Err(self.err(format!("string expected, got {other:?}")));
            }
        };
        self.take(len)
    }

    /// Read a binary (or str-typed) payload as a raw byte slice.
    pub fn read_bin(&mut self) -> Result<&'a [u8], DecodingError> {
        let marker = self.read_marker()?;
        let len = match marker {
            Marker::Bin8 => self.take_len(1)?,
            Marker::Bin16 => self.take_len(2)?,
            Marker::Bin32 => self.take_len(4)?,
            // Tarantool may type scramble-like payloads as str
            Marker::FixStr(n) => n as usize,
            Marker::Str8 => self.take_len(1)?,
            Marker::Str16 => self.take_len(2)?,
            Marker::Str32 => self.take_len(4)?,
            other => {
                self.pos -= 1;
                return Err(self.err(format!("binary expected, got {other:?}")));
            }
        };
        self.take(len)
    }

    fn read_ext_head(&mut self) -> Result<ExtHead, DecodingError> {
        let marker = self.read_marker()?;
        let len = match marker {
            Marker::FixExt1 => 1,
            Marker::FixExt2 => 2,
            Marker::FixExt4 => 4,
            Marker::FixExt8 => 8,
            Marker::FixExt16 => 16,
            Marker::Ext8 => self.take_len(1)?,
            Marker::Ext16 => self.take_len(2)?,
            Marker::Ext32 => self.take_len(4)?,
            other => {
                self.pos -= 1;
                return Err(self.err(format!("ext expected, got {other:?}")));
            }
        };
        let ext_type = self.take_byte()? as i8;
        Ok(ExtHead { ext_type, len })
    }

    fn array_header(&mut self) -> Result<usize, DecodingError> {
        match self.read_marker()? {
            Marker::FixArray(n) => Ok(n as usize),
            Marker::Array16 => self.take_len(2),
            Marker::Array32 => self.take_len(4),
            other => {
                self.pos -= 1;
                Err(self.err(format!("array expected, got {other:?}")))
            }
        }
    }

    fn map_header(&mut self) -> Result<usize, DecodingError> {
        match self.read_marker()? {
            Marker::FixMap(n) => Ok(n as usize),
            Marker::Map16 => self.take_len(2),
            Marker::Map32 => self.take_len(4),
            other => {
                self.pos -= 1;
                Err(self.err(format!("map expected, got {other:?}")))
            }
        }
    }

    /// Read the current item as an array sub-reader and advance past it.
    pub fn array(&mut self) -> Result<ArrayReader<'a>, DecodingError> {
        let start = self.pos;
        let cardinality = self.array_header()?;
        let content = self.pos;
        self.pos = start;
        self.skip()?;
        Ok(ArrayReader {
            inner: MpReader::new(&self.buf[content..self.pos]),
            cardinality,
        })
    }

    /// Read the current item as a map sub-reader and advance past it.
    ///
    /// Besides plain maps this accepts the interval and error extension
    /// types, both of which carry map-shaped payloads.
    pub fn map(&mut self) -> Result<MapReader<'a>, DecodingError> {
        match self.peek_marker()? {
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => return self.ext_map(),
            _ => {}
        }
        let start = self.pos;
        let cardinality = self.map_header()?;
        let content = self.pos;
        self.pos = start;
        self.skip()?;
        Ok(MapReader {
            inner: MpReader::new(&self.buf[content..self.pos]),
            cardinality,
        })
    }

    fn ext_map(&mut self) -> Result<MapReader<'a>, DecodingError> {
        let head = self.read_ext_head()?;
        let payload = self.take(head.len)?;
        let mut inner = MpReader::new(payload);
        match head.ext_type {
            // error payload is a regular map
            ext::ERROR => inner.map(),
            // interval payload is a field count followed by key/value items
            ext::INTERVAL => {
                let cardinality: usize = inner.read()?;
                Ok(MapReader {
                    inner: MpReader::new(inner.remaining()),
                    cardinality,
                })
            }
            other => Err(self.err(format!("unable to read map from ext type {other}"))),
        }
    }

    /// Read the current item as an ext sub-reader over its payload.
    pub fn ext(&mut self) -> Result<(ExtHead, MpReader<'a>), DecodingError> {
        let head = self.read_ext_head()?;
        let payload = self.take(head.len)?;
        Ok((head, MpReader::new(payload)))
    }

    /// Extract the iproto message the cursor points at (header + body)
    /// within a separate reader and advance past it.
    ///
    /// Returns `None` when fewer than the 5 prefix bytes remain. Fails with
    /// "partial iproto packet" when the prefix promises more bytes than the
    /// range holds.
    pub fn iproto_message(&mut self) -> Result<Option<MpReader<'a>>, DecodingError> {
        if self.buf.len() - self.pos < 5 {
            return Ok(None);
        }
        if self.buf[self.pos] != 0xce {
            return Err(self.err("invalid iproto packet"));
        }
        let b = &self.buf[self.pos + 1..self.pos + 5];
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        if self.buf.len() - self.pos - 5 < len {
            return Err(self.err("partial iproto packet"));
        }
        let body = &self.buf[self.pos + 5..self.pos + 5 + len];
        self.pos += 5 + len;
        Ok(Some(MpReader::new(body)))
    }

    /// Serialize the current item to a human-readable string (nil ->
    /// `null`) and advance past it.
    pub fn to_string(&mut self) -> Result<String, DecodingError> {
        let mut out = String::new();
        self.render(&mut out)?;
        Ok(out)
    }

    fn render(&mut self, out: &mut String) -> Result<(), DecodingError> {
        use std::fmt::Write;
        match self.peek_marker()? {
            Marker::Null => {
                self.skip()?;
                out.push_str("null");
            }
            Marker::True | Marker::False => {
                let v: bool = self.read()?;
                let _ = write!(out, "{v}");
            }
            Marker::FixPos(_) | Marker::U8 | Marker::U16 | Marker::U32 | Marker::U64 => {
                let v: u64 = self.read()?;
                let _ = write!(out, "{v}");
            }
            Marker::FixNeg(_) | Marker::I8 | Marker::I16 | Marker::I32 | Marker::I64 => {
                let v: i64 = self.read()?;
                let _ = write!(out, "{v}");
            }
            Marker::F32 | Marker::F64 => {
                let v: f64 = self.read()?;
                let _ = write!(out, "{v}");
            }
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
                let s = self.read_str_slice()?;
                render_quoted(&String::from_utf8_lossy(s), out);
            }
            Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => {
                let s = self.read_bin()?;
                render_quoted(&String::from_utf8_lossy(s), out);
            }
            Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
                let n = self.array_header()?;
                out.push('[');
                for i in 0..n {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render(out)?;
                }
                out.push(']');
            }
            Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
                let n = self.map_header()?;
                out.push('{');
                for i in 0..n {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render(out)?;
                    out.push_str(": ");
                    self.render(out)?;
                }
                out.push('}');
            }
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => self.render_ext(out)?,
            Marker::Reserved => return Err(self.err("invalid messagepack")),
        }
        Ok(())
    }

    fn render_ext(&mut self, out: &mut String) -> Result<(), DecodingError> {
        use std::fmt::Write;
        let at = self.pos;
        let (head, mut payload) = self.ext()?;
        match head.ext_type {
            ext::DECIMAL => out.push_str(&render_decimal(&mut payload)?),
            ext::UUID => {
                let uuid = render_uuid(&mut payload)?;
                let _ = write!(out, "\"{uuid}\"");
            }
            ext::DATETIME => {
                self.pos = at;
                let dt: Datetime = self.read()?;
                if dt.nsec != 0 {
                    let _ = write!(out, "{}.{:09}", dt.epoch_secs, dt.nsec);
                } else {
                    let _ = write!(out, "{}", dt.epoch_secs);
                }
            }
            ext::INTERVAL => {
                self.pos = at;
                let map = self.map()?;
                render_keyed_map(map, interval_field_name, out)?;
            }
            ext::ERROR => {
                self.pos = at;
                let map = self.map()?;
                render_error_stack(map, out)?;
            }
            other => {
                let _ = write!(out, "ext({other})");
            }
        }
        Ok(())
    }
}

fn render_quoted(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
}

fn interval_field_name(key: i64) -> Option<&'static str> {
    Some(match key {
        0 => "year",
        1 => "month",
        2 => "week",
        3 => "day",
        4 => "hour",
        5 => "minute",
        6 => "second",
        7 => "nanosecond",
        8 => "adjust",
        _ => return None,
    })
}

fn error_field_name(key: i64) -> Option<&'static str> {
    Some(match key {
        0 => "type",
        1 => "file",
        2 => "line",
        3 => "message",
        4 => "errno",
        5 => "code",
        6 => "fields",
        _ => return None,
    })
}

fn render_keyed_map(
    map: MapReader<'_>,
    name: impl Fn(i64) -> Option<&'static str>,
    out: &mut String,
) -> Result<(), DecodingError> {
    use std::fmt::Write;
    let mut r = map.into_inner();
    out.push('{');
    let mut first = true;
    while r.has_next() {
        if !first {
            out.push_str(", ");
        }
        first = false;
        let key: i64 = r.read()?;
        match name(key) {
            Some(n) => {
                let _ = write!(out, "\"{n}\": ");
            }
            None => {
                let _ = write!(out, "{key}: ");
            }
        }
        r.render(out)?;
    }
    out.push('}');
    Ok(())
}

fn render_error_stack(map: MapReader<'_>, out: &mut String) -> Result<(), DecodingError> {
    let mut r = map.into_inner();
    out.push('{');
    let mut first = true;
    while r.has_next() {
        if !first {
            out.push_str(", ");
        }
        first = false;
        let key: i64 = r.read()?;
        if key == 0 {
            out.push_str("\"stack\": ");
            let frames = r.array()?;
            let n = frames.len();
            let mut frames = frames.into_inner();
            out.push('[');
            for i in 0..n {
                if i > 0 {
                    out.push_str(", ");
                }
                let frame = frames.map()?;
                render_keyed_map(frame, error_field_name, out)?;
            }
            out.push(']');
        } else {
            use std::fmt::Write;
            let _ = write!(out, "{key}: ");
            r.render(out)?;
        }
    }
    out.push('}');
    Ok(())
}

/// Render a decimal ext payload (scale + packed BCD) without quotes.
fn render_decimal(payload: &mut MpReader<'_>) -> Result<String, DecodingError> {
    let scale: i32 = payload.read()?;
    let bcd = payload.remaining();
    if bcd.is_empty() {
        return Err(payload.err("bad ext value content"));
    }
    let mut nibbles = Vec::with_capacity(bcd.len() * 2);
    for b in bcd {
        nibbles.push(b >> 4);
        nibbles.push(b & 0x0f);
    }
    let sign = nibbles.pop().expect("at least one nibble");
    let negative = sign == 0x0b || sign == 0x0d;
    for n in &nibbles {
        if *n > 9 {
            return Err(payload.err("bad ext value content"));
        }
    }

    let mut digits: String = nibbles.iter().map(|n| (b'0' + n) as char).collect();
    if scale < 0 {
        digits.extend(std::iter::repeat('0').take(-scale as usize));
    }
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    let scale = scale.max(0) as usize;
    if scale >= digits.len() {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take(scale - digits.len()));
        out.push_str(&digits);
    } else {
        let split = digits.len() - scale;
        let int_part = digits[..split].trim_start_matches('0');
        out.push_str(if int_part.is_empty() { "0" } else { int_part });
        if scale > 0 {
            out.push('.');
            out.push_str(&digits[split..]);
        }
    }
    Ok(out)
}

fn render_uuid(payload: &mut MpReader<'_>) -> Result<String, DecodingError> {
    let bytes = payload.remaining();
    if bytes.len() != 16 {
        return Err(payload.err("bad ext value content"));
    }
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    ))
}

/// Decoded Tarantool datetime extension value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Datetime {
    pub epoch_secs: i64,
    pub nsec: i32,
    pub tzoffset: i16,
    pub tzindex: i16,
}

/// Array sub-reader: content range plus declared cardinality.
#[derive(Clone, Debug)]
pub struct ArrayReader<'a> {
    inner: MpReader<'a>,
    cardinality: usize,
}

impl<'a> ArrayReader<'a> {
    pub fn len(&self) -> usize {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Reader positioned at the item at `index` (bounded by the container).
    pub fn get(&self, index: usize) -> Result<MpReader<'a>, DecodingError> {
        if index >= self.cardinality {
            return Err(self.inner.err("array index out of bounds"));
        }
        let mut r = MpReader::new(self.inner.buf);
        for _ in 0..index {
            r.skip()?;
        }
        Ok(MpReader::new(&r.buf[r.pos..]))
    }

    pub fn into_inner(self) -> MpReader<'a> {
        self.inner
    }
}

impl<'a> std::ops::Deref for ArrayReader<'a> {
    type Target = MpReader<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for ArrayReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Map sub-reader: content range plus declared cardinality (pairs).
#[derive(Clone, Debug)]
pub struct MapReader<'a> {
    inner: MpReader<'a>,
    cardinality: usize,
}

impl<'a> MapReader<'a> {
    pub fn len(&self) -> usize {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Find the value stored under an integer key.
    ///
    /// Non-integer keys are skipped over, matching iproto maps which only
    /// ever key on small ints.
    pub fn find(&self, key: i64) -> Result<Option<MpReader<'a>>, DecodingError> {
        let mut r = MpReader::new(self.inner.buf);
        for _ in 0..self.cardinality {
            let matches = match r.clone().read::<i64>() {
                Ok(k) => k == key,
                Err(_) => false,
            };
            r.skip()?;
            if matches {
                return Ok(Some(MpReader::new(&r.buf[r.pos..])));
            }
            r.skip()?;
        }
        Ok(None)
    }

    /// Like [`find`](Self::find), but a missing key is an error.
    pub fn key(&self, key: i64) -> Result<MpReader<'a>, DecodingError> {
        self.find(key)?
            .ok_or_else(|| self.inner.err(format!("key {key} not found")))
    }

    pub fn into_inner(self) -> MpReader<'a> {
        self.inner
    }
}

impl<'a> std::ops::Deref for MapReader<'a> {
    type Target = MpReader<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for MapReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Typed extraction from a [`MpReader`].
pub trait Decode<'a>: Sized {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError>;

    /// Value for an absent tail element of a fixed tuple. Errors unless the
    /// type has a natural "absent" value (`Option`).
    fn decode_missing(r: &MpReader<'a>) -> Result<Self, DecodingError> {
        Err(r.err("required tuple element is missing"))
    }
}

macro_rules! impl_decode_int {
    ($($ty:ty),*) => {$(
        impl<'a> Decode<'a> for $ty {
            fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
                let at = r.pos;
                let value = match r.read_int()? {
                    Int::U(v) => <$ty>::try_from(v).ok(),
                    Int::I(v) => <$ty>::try_from(v).ok(),
                };
                value.ok_or_else(|| {
                    MpReader { buf: r.buf, pos: at }.err("value overflow")
                })
            }
        }
    )*};
}

impl_decode_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<'a> Decode<'a> for bool {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        match r.read_marker()? {
            Marker::True => Ok(true),
            Marker::False => Ok(false),
            other => {
                r.pos -= 1;
                Err(r.err(format!("boolean expected, got {other:?}")))
            }
        }
    }
}

impl<'a> Decode<'a> for f32 {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        match r.peek_marker()? {
            Marker::F32 => {
                r.pos += 1;
                let b = r.take(4)?;
                Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => Err(r.err("float expected")),
        }
    }
}

impl<'a> Decode<'a> for f64 {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        match r.peek_marker()? {
            Marker::F32 => Ok(f32::decode(r)? as f64),
            Marker::F64 => {
                r.pos += 1;
                let b = r.take(8)?;
                Ok(f64::from_be_bytes(b.try_into().expect("length checked")))
            }
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => {
                let at = r.pos;
                let (head, mut payload) = r.ext()?;
                if head.ext_type != ext::DECIMAL {
                    r.pos = at;
                    return Err(r.err("double expected"));
                }
                let rendered = render_decimal(&mut payload)?;
                rendered
                    .parse::<f64>()
                    .map_err(|_| MpReader { buf: r.buf, pos: at }.err("bad ext value content"))
            }
            _ => {
                // numeric coercion from integers
                match r.read_int()? {
                    Int::U(v) => Ok(v as f64),
                    Int::I(v) => Ok(v as f64),
                }
            }
        }
    }
}

impl<'a> Decode<'a> for &'a str {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        let at = r.pos;
        let bytes = r.read_str_slice()?;
        std::str::from_utf8(bytes)
            .map_err(|_| MpReader { buf: r.buf, pos: at }.err("invalid utf-8 in string"))
    }
}

impl<'a> Decode<'a> for String {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        match r.peek_marker()? {
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => {
                // decimal and uuid render unquoted when asked for as string
                let at = r.pos;
                let (head, mut payload) = r.ext()?;
                match head.ext_type {
                    ext::DECIMAL => render_decimal(&mut payload),
                    ext::UUID => render_uuid(&mut payload),
                    _ => {
                        r.pos = at;
                        r.to_string()
                    }
                }
            }
            _ => Ok(<&str>::decode(r)?.to_owned()),
        }
    }
}

impl<'a> Decode<'a> for Datetime {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        let at = r.pos;
        let (head, payload) = r.ext()?;
        let fail = |msg: &str| MpReader { buf: r.buf, pos: at }.err(msg);
        if head.ext_type != ext::DATETIME {
            return Err(fail("datetime ext expected"));
        }
        let bytes = payload.remaining();
        if bytes.len() != 8 && bytes.len() != 16 {
            return Err(fail("unexpected datetime value"));
        }
        let epoch_secs = i64::from_le_bytes(bytes[..8].try_into().expect("length checked"));
        let mut value = Datetime {
            epoch_secs,
            ..Datetime::default()
        };
        if bytes.len() == 16 {
            value.nsec = i32::from_le_bytes(bytes[8..12].try_into().expect("length checked"));
            value.tzoffset = i16::from_le_bytes(bytes[12..14].try_into().expect("length checked"));
            value.tzindex = i16::from_le_bytes(bytes[14..16].try_into().expect("length checked"));
        }
        Ok(value)
    }
}

impl<'a, T: Decode<'a>> Decode<'a> for Option<T> {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        if !r.has_next() {
            return Ok(None);
        }
        if matches!(r.peek_marker()?, Marker::Null) {
            r.skip()?;
            return Ok(None);
        }
        T::decode(r).map(Some)
    }

    fn decode_missing(_r: &MpReader<'a>) -> Result<Self, DecodingError> {
        Ok(None)
    }
}

impl<'a, T: Decode<'a>> Decode<'a> for Vec<T> {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        let n = r.array_header()?;
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push(r.read()?);
        }
        Ok(out)
    }
}

impl<'a, K, V> Decode<'a> for HashMap<K, V>
where
    K: Decode<'a> + Eq + Hash,
    V: Decode<'a>,
{
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        let n = r.map_header()?;
        let mut out = HashMap::with_capacity(n.min(1024));
        for _ in 0..n {
            let key = r.read()?;
            let value = r.read()?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<'a> Decode<'a> for rmpv::Value {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        let mut rest = r.remaining();
        let before = rest.len();
        let value = rmpv::decode::read_value(&mut rest)
            .map_err(|e| r.err(format!("MessagePack decoding error: {e}")))?;
        r.pos += before - rest.len();
        Ok(value)
    }
}

impl<'a> Decode<'a> for ArrayReader<'a> {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        r.array()
    }
}

impl<'a> Decode<'a> for MapReader<'a> {
    fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
        r.map()
    }
}

// Fixed tuples decode from arrays with exact arity; trailing `Option`
// elements may be absent.
macro_rules! impl_decode_tuple {
    ($($name:ident),+) => {
        impl<'a, $($name: Decode<'a>),+> Decode<'a> for ($($name,)+) {
            fn decode(r: &mut MpReader<'a>) -> Result<Self, DecodingError> {
                let n = r.array_header()?;
                let mut left = n;
                let value = ($(
                    if left > 0 {
                        left -= 1;
                        $name::decode(r)?
                    } else {
                        $name::decode_missing(r)?
                    },
                )+);
                for _ in 0..left {
                    r.skip()?;
                }
                Ok(value)
            }
        }
    };
}

impl_decode_tuple!(T0);
impl_decode_tuple!(T0, T1);
impl_decode_tuple!(T0, T1, T2);
impl_decode_tuple!(T0, T1, T2, T3);
impl_decode_tuple!(T0, T1, T2, T3, T4);
impl_decode_tuple!(T0, T1, T2, T3, T4, T5);
impl_decode_tuple!(T0, T1, T2, T3, T4, T5, T6);
impl_decode_tuple!(T0, T1, T2, T3, T4, T5, T6, T7);

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        let clean: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..clean.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn integers_with_bounds_check() {
        let data = hex("cc ff cd 01 00 d0 85");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<u8>().unwrap(), 255);
        assert_eq!(r.read::<u16>().unwrap(), 256);
        assert_eq!(r.read::<i64>().unwrap(), -123);

        let mut r = MpReader::new(&data);
        assert!(r.read::<i8>().is_err()); // 255 does not fit
        let data = hex("d0 85");
        let mut r = MpReader::new(&data);
        assert!(r.read::<u32>().is_err()); // negative into unsigned
    }

    #[test]
    fn skip_validates_bounds() {
        // array of 2 with only one element present
        let data = hex("92 01");
        let mut r = MpReader::new(&data);
        assert!(r.skip().is_err());

        let data = hex("92 01 02");
        let mut r = MpReader::new(&data);
        r.skip().unwrap();
        assert!(!r.has_next());
    }

    #[test]
    fn tuple_with_tail_option() {
        // [3, 4]
        let data = hex("92 03 04");
        let mut r = MpReader::new(&data);
        let t: (i64, i64, Option<i64>) = r.read().unwrap();
        assert_eq!(t, (3, 4, None));

        // [3, 4, 5]
        let data = hex("93 03 04 05");
        let mut r = MpReader::new(&data);
        let t: (i64, i64, Option<i64>) = r.read().unwrap();
        assert_eq!(t, (3, 4, Some(5)));

        // missing required element
        let data = hex("91 03");
        let mut r = MpReader::new(&data);
        assert!(r.read::<(i64, i64)>().is_err());
    }

    #[test]
    fn sequences_and_maps() {
        // [8, 9, 10]
        let data = hex("93 08 09 0a");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<Vec<i32>>().unwrap(), vec![8, 9, 10]);

        // {"a": 5, "b": 6}
        let data = hex("82 a1 61 05 a1 62 06");
        let mut r = MpReader::new(&data);
        let m: HashMap<String, i32> = r.read().unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m["a"], 5);
        assert_eq!(m["b"], 6);
    }

    #[test]
    fn optional_maps_nil_to_none() {
        let data = hex("c0 05");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<Option<u32>>().unwrap(), None);
        assert_eq!(r.read::<Option<u32>>().unwrap(), Some(5));
        // absent -> None
        assert_eq!(r.read::<Option<u32>>().unwrap(), None);
    }

    #[test]
    fn map_reader_find() {
        // {0: 64, 1: 7, 5: 155}
        let data = hex("83 00 40 01 07 05 cc 9b");
        let mut r = MpReader::new(&data);
        let map = r.map().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.key(0).unwrap().read::<u64>().unwrap(), 0x40);
        assert_eq!(map.key(1).unwrap().read::<u64>().unwrap(), 7);
        assert_eq!(map.key(5).unwrap().read::<u64>().unwrap(), 155);
        assert!(map.find(2).unwrap().is_none());
        assert!(map.key(2).is_err());
    }

    #[test]
    fn array_reader_get() {
        let data = hex("93 08 92 01 02 a1 78");
        let mut r = MpReader::new(&data);
        let arr = r.array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(0).unwrap().read::<u32>().unwrap(), 8);
        assert_eq!(arr.get(2).unwrap().read::<String>().unwrap(), "x");
        assert!(arr.get(3).is_err());
    }

    #[test]
    fn decimal_ext() {
        // scale 2, digits 12345, plus sign -> 123.45
        let data = hex("d6 01 02 12 34 5c");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<String>().unwrap(), "123.45");

        let mut r = MpReader::new(&data);
        assert!((r.read::<f64>().unwrap() - 123.45).abs() < 1e-9);

        // negative, scale 0 -> -7
        let data = hex("d5 01 00 7d");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<String>().unwrap(), "-7");

        // scale larger than digit count -> 0.05
        let data = hex("d5 01 02 5c");
        let mut r = MpReader::new(&data);
        assert_eq!(r.read::<String>().unwrap(), "0.05");
    }

    #[test]
    fn uuid_ext() {
        let data = hex("d8 02 64 d2 2e 4d ac 92 4a 23 89 9a e5 9f 34 af 54 79");
        let mut r = MpReader::new(&data);
        assert_eq!(
            r.read::<String>().unwrap(),
            "64d22e4d-ac92-4a23-899a-e59f34af5479"
        );
        // quoted in generic rendering
        let mut r = MpReader::new(&data);
        assert_eq!(
            r.to_string().unwrap(),
            "\"64d22e4d-ac92-4a23-899a-e59f34af5479\""
        );
    }

    #[test]
    fn datetime_ext() {
        // 8-byte form: epoch only (LE)
        let mut data = hex("d7 04");
        data.extend_from_slice(&1629473120i64.to_le_bytes());
        let mut r = MpReader::new(&data);
        let dt: Datetime = r.read().unwrap();
        assert_eq!(dt.epoch_secs, 1629473120);
        assert_eq!(dt.nsec, 0);

        // 16-byte form with nsec and tz offset
        let mut data = hex("c7 10 04");
        data.extend_from_slice(&1629473120i64.to_le_bytes());
        data.extend_from_slice(&123456789i32.to_le_bytes());
        data.extend_from_slice(&180i16.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());
        let mut r = MpReader::new(&data);
        let dt: Datetime = r.read().unwrap();
        assert_eq!(dt.epoch_secs, 1629473120);
        assert_eq!(dt.nsec, 123456789);
        assert_eq!(dt.tzoffset, 180);
        let mut r = MpReader::new(&data);
        assert_eq!(r.to_string().unwrap(), "1629473120.123456789");
    }

    #[test]
    fn interval_ext_as_map() {
        // {year: 1, month: 200, day: -77}
        let data = hex("c7 09 06 03 00 01 01 cc c8 03 d0 b3");
        let mut r = MpReader::new(&data);
        let map = r.map().unwrap();
        assert_eq!(map.key(0).unwrap().read::<i32>().unwrap(), 1);
        assert_eq!(map.key(1).unwrap().read::<i32>().unwrap(), 200);
        assert_eq!(map.key(3).unwrap().read::<i32>().unwrap(), -77);

        let mut r = MpReader::new(&data);
        assert_eq!(
            r.to_string().unwrap(),
            "{\"year\": 1, \"month\": 200, \"day\": -77}"
        );
    }

    #[test]
    fn error_ext_stack() {
        // {0: [{0: "ClientError", 2: 7, 3: "test", 5: 20001}]}
        let inner = hex(
            "81 00 91 84 00 ab 43 6c 69 65 6e 74 45 72 72 6f 72 02 07 03 a4 74 65 73 74 05 cd 4e 21",
        );
        let mut data = vec![0xc7, inner.len() as u8, 0x03];
        data.extend_from_slice(&inner);
        let mut r = MpReader::new(&data);
        let stack = r.map().unwrap();
        let frames = stack.key(0).unwrap().array().unwrap();
        assert_eq!(frames.len(), 1);
        let frame = frames.get(0).unwrap().map().unwrap();
        assert_eq!(frame.key(0).unwrap().read::<String>().unwrap(), "ClientError");
        assert_eq!(frame.key(2).unwrap().read::<u32>().unwrap(), 7);
        assert_eq!(frame.key(3).unwrap().read::<String>().unwrap(), "test");
        assert_eq!(frame.key(5).unwrap().read::<u32>().unwrap(), 20001);

        let mut r = MpReader::new(&data);
        assert_eq!(
            r.to_string().unwrap(),
            "{\"stack\": [{\"type\": \"ClientError\", \"line\": 7, \"message\": \"test\", \"code\": 20001}]}"
        );
    }

    #[test]
    fn iproto_message_framing() {
        // short prefix -> None
        let data = hex("ce 00 00");
        let mut r = MpReader::new(&data);
        assert!(r.iproto_message().unwrap().is_none());

        // wrong lead byte -> invalid
        let data = hex("81 00 00 00 00");
        let mut r = MpReader::new(&data);
        assert!(r.iproto_message().is_err());

        // truncated payload -> partial
        let data = hex("ce 00 00 00 10 80");
        let mut r = MpReader::new(&data);
        let err = r.iproto_message().unwrap_err();
        assert!(err.message().contains("partial iproto packet"));

        // two messages back to back
        let data = hex("ce 00 00 00 01 80 ce 00 00 00 01 c0");
        let mut r = MpReader::new(&data);
        let first = r.iproto_message().unwrap().unwrap();
        assert_eq!(first.remaining(), &hex("80")[..]);
        let second = r.iproto_message().unwrap().unwrap();
        assert_eq!(second.remaining(), &hex("c0")[..]);
        assert!(r.iproto_message().unwrap().is_none());
    }

    #[test]
    fn rendering() {
        let data = hex("95 01 c0 c3 cb 40 1c 7d f3 b6 45 a1 cb a2 68 69");
        let mut r = MpReader::new(&data);
        assert_eq!(r.to_string().unwrap(), "[1, null, true, 7.123, \"hi\"]");
    }
}
