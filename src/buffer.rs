//! Growable contiguous byte buffer with an explicit write cursor.
//!
//! The connection keeps four of these (output, send, receive, input) and
//! moves data between them by swapping contents, so the buffer tracks its
//! cursor itself instead of delegating to `Vec::len`: a swap must carry the
//! cursor along, and `recv` needs to append into uninitialized capacity.

use std::io::Write;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// Hook invoked by the buffer to grow external storage.
///
/// Receives the requested capacity and returns the (possibly moved) start of
/// a region at least that large.
pub type ReallocFn = Box<dyn FnMut(usize) -> NonNull<u8>>;

enum Storage {
    Owned(Vec<u8>),
    External {
        ptr: NonNull<u8>,
        cap: usize,
        realloc: Option<ReallocFn>,
    },
}

/// Contiguous writable byte region.
///
/// Three storage modes: an owned vector (the default), an external region
/// that cannot grow, and an external region with a caller-supplied realloc
/// hook. Content between the start and the write cursor is the buffer's
/// data; the rest of the capacity is scratch.
///
/// Not `Clone`: two buffers never share or duplicate a region. Moving
/// preserves the cursor.
pub struct ByteBuf {
    storage: Storage,
    len: usize,
    on_clear: Option<Box<dyn FnMut()>>,
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl ByteBuf {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: Storage::Owned(Vec::with_capacity(cap)),
            len: 0,
            on_clear: None,
        }
    }

    pub fn from_vec(vec: Vec<u8>) -> Self {
        let len = vec.len();
        Self {
            storage: Storage::Owned(vec),
            len,
            on_clear: None,
        }
    }

    /// Wrap an external region without taking ownership.
    ///
    /// The buffer starts empty over `cap` bytes of scratch. Without a
    /// realloc hook any growth past `cap` panics.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for writes of `cap` bytes for the lifetime of
    /// the buffer (or until the realloc hook replaces it). A hook, when
    /// present, must return a region valid for the requested size; it may
    /// own the storage by capturing it.
    pub unsafe fn external(ptr: NonNull<u8>, cap: usize, realloc: Option<ReallocFn>) -> Self {
        Self {
            storage: Storage::External { ptr, cap, realloc },
            len: 0,
            on_clear: None,
        }
    }

    /// Register a hook fired after every `clear()`.
    pub fn set_on_clear(&mut self, hook: impl FnMut() + 'static) {
        self.on_clear = Some(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(v) => v.capacity(),
            Storage::External { cap, .. } => *cap,
        }
    }

    /// Free space between the write cursor and the end of storage.
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => &v[..self.len],
            // Safety: bytes below the cursor have been written (see advance).
            Storage::External { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), self.len)
            },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(v) => &mut v[..self.len],
            Storage::External { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len)
            },
        }
    }

    /// Grow capacity to at least `cap` without touching content or cursor.
    ///
    /// Panics when the buffer wraps a fixed external region and no realloc
    /// hook was supplied.
    pub fn reserve(&mut self, cap: usize) {
        if cap <= self.capacity() {
            return;
        }
        match &mut self.storage {
            Storage::Owned(v) => v.reserve(cap - v.len()),
            Storage::External { ptr, cap: old_cap, realloc } => {
                let Some(realloc) = realloc else {
                    panic!("fixed buffer capacity exceeded");
                };
                *ptr = realloc(cap);
                *old_cap = cap;
            }
        }
    }

    /// Set the write cursor, growing storage if necessary.
    ///
    /// Bytes between the old and new cursor are unspecified, matching the
    /// contract of a receive buffer being truncated or pre-sized.
    pub fn resize(&mut self, len: usize) {
        if len > self.capacity() {
            self.reserve(len);
        }
        if let Storage::Owned(v) = &mut self.storage {
            if v.len() < len {
                v.resize(len, 0);
            }
        }
        self.len = len;
    }

    /// Move the write cursor back to the start. Content becomes unspecified.
    pub fn clear(&mut self) {
        self.len = 0;
        if let Some(hook) = &mut self.on_clear {
            hook();
        }
    }

    /// Exchange contents (storage and cursor) with another buffer.
    ///
    /// The on-clear hooks stay put: they belong to the buffer's role, not to
    /// its current bytes.
    pub fn swap(&mut self, other: &mut ByteBuf) {
        std::mem::swap(&mut self.storage, &mut other.storage);
        std::mem::swap(&mut self.len, &mut other.len);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let new_len = self.len + bytes.len();
        self.reserve(new_len);
        match &mut self.storage {
            Storage::Owned(v) => {
                v.truncate(self.len);
                v.extend_from_slice(bytes);
            }
            Storage::External { ptr, .. } => unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    ptr.as_ptr().add(self.len),
                    bytes.len(),
                );
            },
        }
        self.len = new_len;
    }

    pub fn push(&mut self, byte: u8) {
        self.extend_from_slice(&[byte]);
    }

    /// Uninitialized tail of the storage, for `recv`-style direct writes.
    pub fn spare_capacity_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        match &mut self.storage {
            Storage::Owned(v) => {
                // Keep Vec's own length pinned at the cursor so its spare
                // capacity starts exactly there.
                v.truncate(self.len);
                v.spare_capacity_mut()
            }
            Storage::External { ptr, cap, .. } => unsafe {
                std::slice::from_raw_parts_mut(
                    ptr.as_ptr().add(self.len) as *mut MaybeUninit<u8>,
                    *cap - self.len,
                )
            },
        }
    }

    /// Commit `n` bytes previously written into `spare_capacity_mut()`.
    ///
    /// # Safety
    ///
    /// The first `n` bytes of the spare capacity must have been initialized.
    pub unsafe fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        if let Storage::Owned(v) = &mut self.storage {
            v.set_len(self.len + n);
        }
        self.len += n;
    }
}

impl Write for ByteBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl AsRef<[u8]> for ByteBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
