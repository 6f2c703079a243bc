use std::fmt;
use std::os::fd::{AsRawFd, RawFd};

use crate::ctrl::ControlChannel;
use crate::error::{Error, Result};
use crate::rdma::mr::check_bounds;

/// Two-sided messaging over a connected stream socket.
///
/// The stream carries no message boundaries: `recv` returns whatever the
/// socket has ready, which may be less than a whole message sent by the peer.
pub struct StreamCommunicator {
    buffer: Option<Box<[u8]>>,
    ctrl: ControlChannel,
}

impl StreamCommunicator {
    /// Wrap a connected stream.
    pub fn new(ctrl: impl Into<ControlChannel>) -> Self {
        Self {
            buffer: None,
            ctrl: ctrl.into(),
        }
    }

    /// Replace the buffer, returning the previous one.
    pub fn set_buffer(&mut self, buf: Box<[u8]>) -> Result<Option<Box<[u8]>>> {
        Ok(self.buffer.replace(buf))
    }

    /// Take the buffer out.
    pub fn take_buffer(&mut self) -> Result<Option<Box<[u8]>>> {
        Ok(self.buffer.take())
    }

    #[inline]
    pub fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.buffer.as_deref_mut()
    }

    fn region(&self, op: &'static str, len: usize, offset: usize) -> Result<&[u8]> {
        let buf = self.buffer.as_deref().ok_or(Error::NoBuffer { op })?;
        check_bounds(op, len, offset, buf.len())?;
        Ok(&buf[offset..offset + len])
    }

    /// Validate a receive region. Stream sockets need nothing posted, so this
    /// only checks bounds.
    pub fn post_receive(&mut self, len: usize, offset: usize) -> Result<()> {
        self.region("post_receive", len, offset).map(|_| ())
    }

    /// Write `len` bytes starting at `offset`. Returns `len`.
    pub fn send(&mut self, len: usize, offset: usize) -> Result<usize> {
        const OP: &str = "send";
        let buf = self.buffer.as_deref().ok_or(Error::NoBuffer { op: OP })?;
        check_bounds(OP, len, offset, buf.len())?;
        self.ctrl.write_all(OP, &buf[offset..offset + len])?;
        log::trace!("sent {} bytes from offset {}", len, offset);
        Ok(len)
    }

    /// Read up to `len` bytes into the buffer at `offset`, blocking until at
    /// least one byte arrives. Returns the number of bytes read.
    pub fn recv(&mut self, len: usize, offset: usize) -> Result<usize> {
        const OP: &str = "recv";
        let buf = self.buffer.as_deref_mut().ok_or(Error::NoBuffer { op: OP })?;
        check_bounds(OP, len, offset, buf.len())?;
        let n = self.ctrl.read_some(OP, &mut buf[offset..offset + len])?;
        log::trace!("received {} bytes at offset {}", n, offset);
        Ok(n)
    }

    /// Write all of `data`, bypassing the buffer.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.ctrl.write_all("send", data)?;
        Ok(data.len())
    }

    /// Read whatever is available into `data`, bypassing the buffer.
    pub fn recv_bytes(&mut self, data: &mut [u8]) -> Result<usize> {
        self.ctrl.read_some("recv", data)
    }

    /// Fill `data` completely, bypassing the buffer.
    pub fn recv_exact(&mut self, data: &mut [u8]) -> Result<()> {
        self.ctrl.read_exact("recv", data)
    }
}

impl AsRawFd for StreamCommunicator {
    fn as_raw_fd(&self) -> RawFd {
        self.ctrl.as_raw_fd()
    }
}

impl fmt::Debug for StreamCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCommunicator")
            .field("ctrl", &self.ctrl)
            .field("buffer_len", &self.buffer.as_ref().map(|b| b.len()))
            .finish()
    }
}
