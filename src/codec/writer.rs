//! Streaming MsgPack encoder with nested container tracking.
//!
//! Containers are opened with a maximum expected cardinality; the header is
//! sized for that value up front. `finalize()` rewrites the header in place
//! with the number of items actually written, so the declared cardinality
//! may shrink but never grow past the reserved header slot.

use std::io::Write;

use crate::buffer::ByteBuf;
use crate::codec::reader::MpReader;
use crate::errors::EncodingError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    Array,
    Map,
    /// iproto frame: `0xce` + 4 length bytes reserved at `head_offset`.
    Frame,
}

#[derive(Debug)]
pub(crate) struct Container {
    pub kind: ContainerKind,
    pub head_offset: usize,
    pub max_cardinality: u32,
    pub items: u32,
}

/// Number of bytes an array/map header occupies for a given cardinality.
fn header_width(cardinality: u32) -> usize {
    if cardinality < 16 {
        1
    } else if cardinality <= u16::MAX as u32 {
        3
    } else {
        5
    }
}

/// MsgPack encoder appending into a [`ByteBuf`].
pub struct MpWriter<'a> {
    buf: &'a mut ByteBuf,
    containers: Vec<Container>,
}

impl<'a> MpWriter<'a> {
    pub fn new(buf: &'a mut ByteBuf) -> Self {
        Self {
            buf,
            containers: Vec::new(),
        }
    }

    pub fn buffer(&mut self) -> &mut ByteBuf {
        self.buf
    }

    /// Count a freshly written item against the innermost open container.
    fn bump(&mut self, items: u32) {
        if let Some(c) = self.containers.last_mut() {
            c.items += items;
        }
    }

    pub(crate) fn push_container(&mut self, kind: ContainerKind, max_cardinality: u32) {
        self.containers.push(Container {
            kind,
            head_offset: self.buf.len(),
            max_cardinality,
            items: 0,
        });
    }

    /// Open an array of at most `max_cardinality` items.
    pub fn begin_array(&mut self, max_cardinality: u32) -> Result<(), EncodingError> {
        self.bump(1);
        self.push_container(ContainerKind::Array, max_cardinality);
        rmp::encode::write_array_len(&mut *self.buf, max_cardinality)?;
        Ok(())
    }

    /// Open a map of at most `max_cardinality` key/value pairs.
    pub fn begin_map(&mut self, max_cardinality: u32) -> Result<(), EncodingError> {
        self.bump(1);
        self.push_container(ContainerKind::Map, max_cardinality);
        rmp::encode::write_map_len(&mut *self.buf, max_cardinality)?;
        Ok(())
    }

    /// Close the innermost container, rewriting its cardinality in place.
    ///
    /// Panics if a map holds an odd number of items: that is a composition
    /// bug, not a data error.
    pub fn finalize(&mut self) -> Result<(), EncodingError> {
        let c = self
            .containers
            .pop()
            .ok_or(EncodingError::NoOpenContainer)?;
        match c.kind {
            ContainerKind::Frame => {
                let total = self.buf.len() - c.head_offset;
                if total == 0 {
                    return Ok(());
                }
                if total - 5 > u32::MAX as usize {
                    return Err(EncodingError::RequestSizeExceeded);
                }
                let len = (total - 5) as u32;
                self.buf.as_mut_slice()[c.head_offset + 1..c.head_offset + 5]
                    .copy_from_slice(&len.to_be_bytes());
                Ok(())
            }
            ContainerKind::Array => {
                self.patch_header(c.head_offset, c.max_cardinality, c.items, false)
            }
            ContainerKind::Map => {
                assert!(c.items % 2 == 0, "odd number of map items");
                self.patch_header(c.head_offset, c.max_cardinality, c.items / 2, true)
            }
        }
    }

    /// Close every open container (and frame, if any).
    pub fn finalize_all(&mut self) -> Result<(), EncodingError> {
        while !self.containers.is_empty() {
            self.finalize()?;
        }
        Ok(())
    }

    fn patch_header(
        &mut self,
        head_offset: usize,
        max_cardinality: u32,
        actual: u32,
        is_map: bool,
    ) -> Result<(), EncodingError> {
        if actual == max_cardinality {
            return Ok(());
        }
        let reserved = header_width(max_cardinality);
        if actual > max_cardinality && header_width(actual) > reserved {
            return Err(EncodingError::HeaderSizeExceeded(if is_map {
                "map"
            } else {
                "array"
            }));
        }
        let head = &mut self.buf.as_mut_slice()[head_offset..];
        match reserved {
            1 => head[0] = if is_map { 0x80 } else { 0x90 } | actual as u8,
            3 => head[1..3].copy_from_slice(&(actual as u16).to_be_bytes()),
            _ => head[1..5].copy_from_slice(&actual.to_be_bytes()),
        }
        Ok(())
    }

    pub fn write_nil(&mut self) -> Result<(), EncodingError> {
        rmp::encode::write_nil(&mut *self.buf)?;
        self.bump(1);
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), EncodingError> {
        rmp::encode::write_bool(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    /// Compact unsigned integer.
    pub fn write_uint(&mut self, value: u64) -> Result<(), EncodingError> {
        rmp::encode::write_uint(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    /// Compact signed integer.
    pub fn write_int(&mut self, value: i64) -> Result<(), EncodingError> {
        rmp::encode::write_sint(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    /// Fixed-width u64 (`0xcf`), for fields a peer overwrites or echoes.
    pub fn write_u64_fixed(&mut self, value: u64) -> Result<(), EncodingError> {
        rmp::encode::write_u64(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), EncodingError> {
        rmp::encode::write_f32(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), EncodingError> {
        rmp::encode::write_f64(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), EncodingError> {
        if value.len() > u32::MAX as usize {
            return Err(EncodingError::TooLongString);
        }
        rmp::encode::write_str(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    pub fn write_bin(&mut self, value: &[u8]) -> Result<(), EncodingError> {
        rmp::encode::write_bin(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    /// Append a dynamically typed [`rmpv::Value`].
    pub fn write_value(&mut self, value: &rmpv::Value) -> Result<(), EncodingError> {
        rmpv::encode::write_value(&mut *self.buf, value)?;
        self.bump(1);
        Ok(())
    }

    /// Append an already-encoded MsgPack region.
    ///
    /// `cardinality` is the number of top-level items the region holds;
    /// pass 0 to have it counted by scanning.
    pub fn write_raw(&mut self, raw: &[u8], cardinality: u32) -> Result<(), EncodingError> {
        let cardinality = if cardinality == 0 {
            let mut r = MpReader::new(raw);
            let mut count = 0u32;
            while r.has_next() {
                r.skip()
                    .map_err(|e| EncodingError::MessagePack(anyhow::anyhow!("{e}")))?;
                count += 1;
            }
            count
        } else {
            cardinality
        };
        self.buf.write_all(raw)?;
        self.bump(cardinality);
        Ok(())
    }
}
