use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::slice;

use super::perm::Permission;
use super::provider::{DeviceContext, MemoryRegion, Sge};
use super::type_alias::*;
use super::wire::MrRemote;
use crate::error::{Error, Result};

/// A heap buffer registered with a provider.
///
/// The buffer is taken apart into a raw pointer at registration so that the
/// provider's view of the memory and the safe slices handed out here never
/// alias a live `Box`. Dropping deregisters first and frees second.
pub struct RegisteredBuffer {
    mr: ManuallyDrop<Box<dyn MemoryRegion>>,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is uniquely owned; `MemoryRegion` is `Send`.
unsafe impl Send for RegisteredBuffer {}

impl RegisteredBuffer {
    /// Register `buf` for local write and remote read/write.
    pub fn register(ctx: &dyn DeviceContext, buf: Box<[u8]>) -> Result<Self> {
        const OP: &str = "set_buffer";
        if buf.is_empty() {
            return Err(Error::Registration {
                op: OP,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty buffer"),
            });
        }

        let len = buf.len();
        let raw = Box::into_raw(buf) as *mut u8;
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };

        // SAFETY: the memory stays allocated until `self` is dropped, which
        // deregisters before freeing.
        match unsafe { ctx.reg_mr(ptr.as_ptr(), len, Permission::default()) } {
            Ok(mr) => {
                log::debug!(
                    "registered {} bytes at {:p} (lkey {:#x}, rkey {:#x})",
                    len,
                    ptr,
                    mr.lkey(),
                    mr.rkey()
                );
                Ok(Self {
                    mr: ManuallyDrop::new(mr),
                    ptr,
                    len,
                })
            }
            Err(source) => {
                // SAFETY: reconstruct the box we just took apart.
                drop(unsafe { Box::from_raw(slice::from_raw_parts_mut(raw, len)) });
                Err(Error::Registration { op: OP, source })
            }
        }
    }

    /// Get the buffer length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the start address.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        self.mr.lkey()
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.mr.rkey()
    }

    /// Describe the whole buffer for a peer's one-sided access.
    pub fn remote(&self) -> MrRemote {
        MrRemote {
            addr: self.ptr.as_ptr() as u64,
            rkey: self.rkey(),
        }
    }

    /// Check that `[offset, offset + len)` lies inside the buffer.
    pub fn check_bounds(&self, op: &'static str, len: usize, offset: usize) -> Result<()> {
        check_bounds(op, len, offset, self.len)
    }

    /// Build a scatter/gather entry for a bounds-checked region.
    pub(crate) fn sge(&self, len: usize, offset: usize) -> Sge {
        Sge {
            addr: self.ptr.as_ptr() as u64 + offset as u64,
            length: len as u32,
            lkey: self.lkey(),
        }
    }

    /// View the contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `len` initialized bytes owned by `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the contents mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees uniqueness on this side.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Deregister and hand the buffer back.
    pub fn into_inner(self) -> Box<[u8]> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used again, so the region is dropped once.
        unsafe { ManuallyDrop::drop(&mut this.mr) };
        log::debug!("deregistered {} bytes at {:p}", this.len, this.ptr);
        // SAFETY: deregistered; the memory came from `Box::into_raw`.
        unsafe { Box::from_raw(slice::from_raw_parts_mut(this.ptr.as_ptr(), this.len)) }
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        // SAFETY: the region is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.mr) };
        log::debug!("deregistered {} bytes at {:p}", self.len, self.ptr);
        // SAFETY: deregistered; the memory came from `Box::into_raw`.
        drop(unsafe { Box::from_raw(slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)) });
    }
}

impl fmt::Debug for RegisteredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .field("lkey", &format_args!("{:#x}", self.lkey()))
            .field("rkey", &format_args!("{:#x}", self.rkey()))
            .finish()
    }
}

/// Check that `[offset, offset + len)` lies inside `extent` bytes.
pub(crate) fn check_bounds(op: &'static str, len: usize, offset: usize, extent: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= extent => Ok(()),
        _ => Err(Error::OutOfBounds {
            op,
            offset,
            len,
            extent,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::soft::SoftFabric;
    use crate::rdma::provider::Provider;

    #[test]
    fn register_and_give_back() -> anyhow::Result<()> {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        let ctx = fabric.open("soft_0", 1, 0)?;

        let mut buf = RegisteredBuffer::register(ctx.as_ref(), vec![7u8; 64].into_boxed_slice())?;
        assert_eq!(fabric.registered_regions(), 1);
        assert_eq!(buf.len(), 64);
        assert_ne!(buf.rkey(), 0);
        assert_eq!(buf.remote().addr, buf.addr() as u64);

        buf.as_mut_slice()[0] = 1;
        let sge = buf.sge(16, 8);
        assert_eq!(sge.addr, buf.addr() as u64 + 8);
        assert_eq!(sge.length, 16);

        let back = buf.into_inner();
        assert_eq!(fabric.registered_regions(), 0);
        assert_eq!(back[0], 1);
        assert_eq!(back[1], 7);
        Ok(())
    }

    #[test]
    fn empty_buffer_is_rejected() -> anyhow::Result<()> {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        let ctx = fabric.open("soft_0", 1, 0)?;
        let err = RegisteredBuffer::register(ctx.as_ref(), Box::new([])).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
        Ok(())
    }

    #[test]
    fn bounds() {
        assert!(check_bounds("send", 10, 0, 10).is_ok());
        assert!(check_bounds("send", 0, 10, 10).is_ok());
        assert!(matches!(
            check_bounds("send", 11, 0, 10),
            Err(Error::OutOfBounds { extent: 10, .. })
        ));
        assert!(check_bounds("send", 1, usize::MAX, 10).is_err());
    }
}
