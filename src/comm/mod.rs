use std::os::fd::{AsRawFd, RawFd};

use crate::ctrl::ControlChannel;
use crate::error::Result;
use crate::rdma::provider::Provider;
use crate::rdma::type_alias::GidIndex;

pub mod bulk;
mod rdma;
mod stream;

pub use rdma::RdmaCommunicator;
pub use stream::StreamCommunicator;

/// The transport behind a [`Communicator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// A connected stream socket.
    Stream,

    /// An RDMA RC queue pair.
    Rdma,
}

/// A two-sided communicator over either transport.
///
/// Both variants move bytes between the caller's buffer and the peer with the
/// same calls. Operations a transport does not support are only available
/// through the variant itself.
#[derive(Debug)]
pub enum Communicator {
    Stream(StreamCommunicator),
    Rdma(RdmaCommunicator),
}

impl Communicator {
    /// Communicate over a connected stream.
    pub fn stream(ctrl: impl Into<ControlChannel>) -> Self {
        Communicator::Stream(StreamCommunicator::new(ctrl))
    }

    /// Communicate over an RC queue pair on `device`, using `ctrl` for the
    /// descriptor exchange.
    pub fn rdma(
        ctrl: impl Into<ControlChannel>,
        provider: &dyn Provider,
        device: &str,
        gid_index: GidIndex,
    ) -> Result<Self> {
        RdmaCommunicator::new(ctrl, provider, device, gid_index).map(Communicator::Rdma)
    }

    #[inline]
    pub fn kind(&self) -> Transport {
        match self {
            Communicator::Stream(_) => Transport::Stream,
            Communicator::Rdma(_) => Transport::Rdma,
        }
    }

    /// Replace the buffer, returning the previous one.
    pub fn set_buffer(&mut self, buf: Box<[u8]>) -> Result<Option<Box<[u8]>>> {
        match self {
            Communicator::Stream(c) => c.set_buffer(buf),
            Communicator::Rdma(c) => c.set_buffer(buf),
        }
    }

    pub fn take_buffer(&mut self) -> Result<Option<Box<[u8]>>> {
        match self {
            Communicator::Stream(c) => c.take_buffer(),
            Communicator::Rdma(c) => c.take_buffer(),
        }
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            Communicator::Stream(c) => c.buffer(),
            Communicator::Rdma(c) => c.buffer(),
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Communicator::Stream(c) => c.buffer_mut(),
            Communicator::Rdma(c) => c.buffer_mut(),
        }
    }

    /// Prepare to receive `len` bytes at `offset`.
    pub fn post_receive(&mut self, len: usize, offset: usize) -> Result<()> {
        match self {
            Communicator::Stream(c) => c.post_receive(len, offset),
            Communicator::Rdma(c) => c.post_receive(len, offset),
        }
    }

    /// Send `len` bytes starting at `offset`.
    pub fn send(&mut self, len: usize, offset: usize) -> Result<usize> {
        match self {
            Communicator::Stream(c) => c.send(len, offset),
            Communicator::Rdma(c) => c.send(len, offset),
        }
    }

    /// Receive up to `len` bytes at `offset`. Returns the byte count.
    pub fn recv(&mut self, len: usize, offset: usize) -> Result<usize> {
        match self {
            Communicator::Stream(c) => c.recv(len, offset),
            Communicator::Rdma(c) => c.recv(len, offset),
        }
    }

    /// Get the largest message one `send` may carry.
    pub fn max_message_size(&self) -> usize {
        match self {
            Communicator::Stream(_) => usize::MAX,
            Communicator::Rdma(c) => c.max_message_size(),
        }
    }

    pub fn as_stream(&self) -> Option<&StreamCommunicator> {
        match self {
            Communicator::Stream(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut StreamCommunicator> {
        match self {
            Communicator::Stream(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_rdma(&self) -> Option<&RdmaCommunicator> {
        match self {
            Communicator::Rdma(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_rdma_mut(&mut self) -> Option<&mut RdmaCommunicator> {
        match self {
            Communicator::Rdma(c) => Some(c),
            _ => None,
        }
    }
}

impl AsRawFd for Communicator {
    /// Get the descriptor of the control stream.
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Communicator::Stream(c) => c.as_raw_fd(),
            Communicator::Rdma(c) => c.as_raw_fd(),
        }
    }
}

impl From<StreamCommunicator> for Communicator {
    fn from(c: StreamCommunicator) -> Self {
        Communicator::Stream(c)
    }
}

impl From<RdmaCommunicator> for Communicator {
    fn from(c: RdmaCommunicator) -> Self {
        Communicator::Rdma(c)
    }
}
