//! Uniform two-sided messaging over stream sockets and RDMA reliable-connected
//! queue pairs.
//!
//! A [`Communicator`] moves bytes between a caller-owned buffer and a remote
//! peer. The caller picks the transport when constructing it and then uses the
//! same `post_receive` / `send` / `recv` calls on either variant:
//!
//! - [`Communicator::Stream`] writes and reads an ordinary connected socket.
//! - [`Communicator::Rdma`] drives an RC queue pair. It registers the buffer,
//!   exchanges a 32-byte [`WireMsg`] over the control stream, walks the queue
//!   pair through INIT, RTR and RTS, and busy-polls the completion queue.
//!
//! RDMA devices are reached through a [`Provider`]. The `verbs` feature enables
//! [`VerbsProvider`], backed by `libibverbs`. The always-available
//! [`SoftFabric`] is an in-process provider with the same semantics, which lets
//! the RDMA path run without hardware.
//!
//! # Example
//!
//! ```rust
//! use std::os::unix::net::UnixStream;
//! use std::thread;
//!
//! use rrcomm::ctrl::Role;
//! use rrcomm::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
//!     let (a, b) = UnixStream::pair()?;
//!
//!     let peer = {
//!         let fabric = fabric.clone();
//!         thread::spawn(move || -> rrcomm::Result<Vec<u8>> {
//!             let mut comm = RdmaCommunicator::new(b, &fabric, "soft_1", 0)?;
//!             comm.set_buffer(vec![0u8; 64].into_boxed_slice())?;
//!             comm.establish(Role::Server, false)?;
//!             comm.post_receive(64, 0)?;
//!             let n = comm.recv(64, 0)?;
//!             Ok(comm.buffer().unwrap()[..n].to_vec())
//!         })
//!     };
//!
//!     let mut comm = RdmaCommunicator::new(a, &fabric, "soft_0", 0)?;
//!     comm.set_buffer(b"hello".to_vec().into_boxed_slice())?;
//!     comm.establish(Role::Client, false)?;
//!     comm.send(5, 0)?;
//!
//!     assert_eq!(peer.join().unwrap()?, b"hello");
//!     Ok(())
//! }
//! ```

#[cfg(feature = "verbs")]
mod bindings;
#[cfg(feature = "verbs")]
#[macro_use]
mod utils;

mod comm;
mod error;

/// Communicator configuration.
pub mod config;

/// Control channel and connection helpers.
pub mod ctrl;

/// RDMA building blocks: providers, queue pairs, memory and descriptors.
pub mod rdma;

pub use comm::bulk::{self, BulkTransfer, Chunk, TransferStats};
pub use comm::{Communicator, RdmaCommunicator, StreamCommunicator, Transport};
pub use config::CommConfig;
pub use error::{Error, Result, TransferCause};
pub use rdma::gid::Gid;
pub use rdma::provider::soft::SoftFabric;
#[cfg(feature = "verbs")]
pub use rdma::provider::verbs::VerbsProvider;
pub use rdma::provider::Provider;
pub use rdma::qp::QpState;
pub use rdma::wc::{WcOpcode, WcStatus};
pub use rdma::wire::WireMsg;
