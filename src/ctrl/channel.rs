use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};

/// A reliable, ordered byte stream usable as a control channel.
pub trait ControlStream: Read + Write + AsRawFd + Send {}

impl<T: Read + Write + AsRawFd + Send> ControlStream for T {}

/// An already-connected control stream.
///
/// Failures are reported with the name of the operation that hit them. A peer
/// close shows up as [`Error::ConnectionClosed`].
pub struct ControlChannel {
    stream: Box<dyn ControlStream>,
}

impl ControlChannel {
    /// Wrap any connected stream.
    pub fn new<S: ControlStream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Write all of `buf`, looping over partial writes.
    pub fn write_all(&mut self, op: &'static str, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed { op }),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_stream(op, e)),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely. A close before that is [`Error::ConnectionClosed`].
    pub fn read_exact(&mut self, op: &'static str, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .map_err(|e| Error::from_stream(op, e))
    }

    /// Read whatever is available into `buf`, blocking until at least one
    /// byte arrives. Returns 0 only if `buf` is empty.
    pub fn read_some(&mut self, op: &'static str, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed { op }),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_stream(op, e)),
            }
        }
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

impl From<TcpStream> for ControlChannel {
    fn from(stream: TcpStream) -> Self {
        Self::new(stream)
    }
}

impl From<UnixStream> for ControlChannel {
    fn from(stream: UnixStream) -> Self {
        Self::new(stream)
    }
}

impl From<OwnedFd> for ControlChannel {
    /// Adopt a connected socket descriptor obtained elsewhere.
    fn from(fd: OwnedFd) -> Self {
        Self::new(TcpStream::from(fd))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn large_write_is_not_truncated() -> anyhow::Result<()> {
        let (a, b) = UnixStream::pair()?;
        let payload = (0..(4 << 20)).map(|i| i as u8).collect::<Vec<_>>();
        let expected = payload.clone();

        let reader = thread::spawn(move || {
            let mut ch = ControlChannel::from(b);
            let mut buf = vec![0u8; 4 << 20];
            ch.read_exact("test", &mut buf).map(|_| buf)
        });

        let mut ch = ControlChannel::from(a);
        ch.write_all("test", &payload)?;
        assert_eq!(reader.join().unwrap()?, expected);
        Ok(())
    }

    #[test]
    fn close_is_reported() -> anyhow::Result<()> {
        let (a, b) = UnixStream::pair()?;
        drop(b);

        let mut ch = ControlChannel::from(a);
        let mut buf = [0u8; 4];
        assert!(ch.read_some("recv", &mut buf).unwrap_err().is_connection_closed());
        assert_eq!(ch.read_some("recv", &mut [])?, 0);
        Ok(())
    }
}
