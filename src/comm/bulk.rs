//! Large transfers split into chunks no larger than one message may be.
//!
//! Both sides must plan with the same ceiling: over RDMA each chunk is one
//! send matched by one receive of the same size.

use std::time::Duration;

use quanta::Instant;

use super::Communicator;
use crate::config::CommConfig;
use crate::error::{Error, Result};
use crate::rdma::mr::check_bounds;

/// One piece of a bulk transfer, relative to the transfer's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

/// Iterator over the chunks of a transfer. See [`chunks`].
#[derive(Debug, Clone)]
pub struct Chunks {
    total: usize,
    ceiling: usize,
    offset: usize,
    index: usize,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.total {
            return None;
        }
        let len = self.ceiling.min(self.total - self.offset);
        let chunk = Chunk {
            index: self.index,
            offset: self.offset,
            len,
        };
        self.offset += len;
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = chunk_count(self.total - self.offset, self.ceiling);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}

/// Split `total` bytes into `ceil(total / ceiling)` chunks. Every chunk but
/// the last is exactly `ceiling` bytes. A zero `ceiling` is treated as 1.
pub fn chunks(total: usize, ceiling: usize) -> Chunks {
    Chunks {
        total,
        ceiling: ceiling.max(1),
        offset: 0,
        index: 0,
    }
}

/// Get the number of chunks [`chunks`] yields.
#[inline]
pub fn chunk_count(total: usize, ceiling: usize) -> usize {
    total.div_ceil(ceiling.max(1))
}

/// Outcome of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferStats {
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Throughput in gigabits per second.
    pub fn gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / 1e9
    }
}

/// Moves a region of the buffer as a sequence of chunks.
#[derive(Debug, Clone, Copy)]
pub struct BulkTransfer {
    ceiling: usize,
}

impl BulkTransfer {
    pub fn new(ceiling: usize) -> Result<Self> {
        if ceiling == 0 {
            return Err(Error::InvalidConfig("chunk ceiling must be positive".to_owned()));
        }
        Ok(Self { ceiling })
    }

    /// Use the configured chunk size, capped at what the communicator can
    /// carry in one message.
    pub fn for_communicator(comm: &Communicator, config: &CommConfig) -> Result<Self> {
        Self::new(config.chunk_size.min(comm.max_message_size()))
    }

    #[inline]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Plan the chunks of a `len`-byte transfer.
    pub fn plan(&self, len: usize) -> Chunks {
        chunks(len, self.ceiling)
    }

    fn check(&self, op: &'static str, comm: &Communicator, len: usize, offset: usize) -> Result<()> {
        let extent = comm.buffer().ok_or(Error::NoBuffer { op })?.len();
        check_bounds(op, len, offset, extent)
    }

    /// Send `len` bytes starting at `offset`, one chunk at a time.
    pub fn send(&self, comm: &mut Communicator, len: usize, offset: usize) -> Result<TransferStats> {
        const OP: &str = "bulk_send";
        self.check(OP, comm, len, offset)?;

        let start = Instant::now();
        let mut count = 0;
        for chunk in self.plan(len) {
            log::trace!("sending chunk {} ({} bytes)", chunk.index, chunk.len);
            comm.send(chunk.len, offset + chunk.offset)?;
            count += 1;
        }
        let stats = TransferStats {
            bytes: len,
            chunks: count,
            elapsed: start.elapsed(),
        };
        log::debug!(
            "sent {} bytes in {} chunk(s), {:.2} Gbps",
            stats.bytes,
            stats.chunks,
            stats.gbps()
        );
        Ok(stats)
    }

    /// Receive `len` bytes into the buffer at `offset`, one chunk at a time.
    ///
    /// A chunk that arrives short is completed by further receives, which is
    /// how stream sockets behave.
    pub fn recv(&self, comm: &mut Communicator, len: usize, offset: usize) -> Result<TransferStats> {
        const OP: &str = "bulk_recv";
        self.check(OP, comm, len, offset)?;

        let start = Instant::now();
        let mut count = 0;
        for chunk in self.plan(len) {
            let mut filled = 0;
            while filled < chunk.len {
                let at = offset + chunk.offset + filled;
                let want = chunk.len - filled;
                comm.post_receive(want, at)?;
                match comm.recv(want, at)? {
                    0 => return Err(Error::ConnectionClosed { op: OP }),
                    n => filled += n,
                }
            }
            log::trace!("received chunk {} ({} bytes)", chunk.index, chunk.len);
            count += 1;
        }
        let stats = TransferStats {
            bytes: len,
            chunks: count,
            elapsed: start.elapsed(),
        };
        log::debug!(
            "received {} bytes in {} chunk(s), {:.2} Gbps",
            stats.bytes,
            stats.chunks,
            stats.gbps()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::ctrl::Role;
    use crate::rdma::provider::soft::SoftFabric;

    #[test]
    fn chunk_plan() {
        for (total, ceiling) in [(0, 4), (1, 4), (4, 4), (5, 4), (10, 3), (1 << 20, 1000)] {
            let plan = chunks(total, ceiling).collect::<Vec<_>>();
            assert_eq!(plan.len(), chunk_count(total, ceiling));
            assert_eq!(plan.len(), (total + ceiling - 1) / ceiling);
            assert_eq!(plan.iter().map(|c| c.len).sum::<usize>(), total);

            let mut next = 0;
            for (i, c) in plan.iter().enumerate() {
                assert_eq!((c.index, c.offset), (i, next));
                if i + 1 < plan.len() {
                    assert_eq!(c.len, ceiling);
                } else {
                    assert!(c.len > 0 && c.len <= ceiling);
                }
                next += c.len;
            }
        }
        assert_eq!(chunks(7, 0).count(), 7);
        assert_eq!(chunks(10, 3).len(), 4);
    }

    #[test]
    fn stats_throughput() {
        let stats = TransferStats {
            bytes: 1_000_000_000,
            chunks: 1,
            elapsed: Duration::from_secs(2),
        };
        assert!((stats.gbps() - 4.0).abs() < 1e-9);
        assert_eq!(TransferStats { elapsed: Duration::ZERO, ..stats }.gbps(), 0.0);
    }

    fn pattern(len: usize) -> Box<[u8]> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn bulk_over_stream() -> anyhow::Result<()> {
        const LEN: usize = 1 << 20;
        let (x, y) = UnixStream::pair()?;
        let bulk = BulkTransfer::new(64 << 10)?;

        let sender = thread::spawn(move || -> crate::Result<TransferStats> {
            let mut comm = Communicator::stream(x);
            comm.set_buffer(pattern(LEN))?;
            bulk.send(&mut comm, LEN, 0)
        });

        let mut comm = Communicator::stream(y);
        comm.set_buffer(vec![0u8; LEN + 16].into_boxed_slice())?;
        let stats = bulk.recv(&mut comm, LEN, 16)?;
        assert_eq!(stats.bytes, LEN);
        assert_eq!(stats.chunks, 16);
        assert_eq!(&comm.buffer().unwrap()[16..], &pattern(LEN)[..]);
        assert_eq!(sender.join().unwrap()?.chunks, 16);
        Ok(())
    }

    #[test]
    fn bulk_over_rdma() -> anyhow::Result<()> {
        const LEN: usize = 100_000;
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (x, y) = UnixStream::pair()?;
        let mut a = Communicator::rdma(x, &fabric, "soft_0", 0)?;
        let mut b = Communicator::rdma(y, &fabric, "soft_1", 0)?;
        a.set_buffer(pattern(LEN))?;
        b.set_buffer(vec![0u8; LEN].into_boxed_slice())?;

        let config = CommConfig {
            chunk_size: 12_288,
            ..Default::default()
        };
        let bulk = BulkTransfer::for_communicator(&a, &config)?;
        assert_eq!(bulk.ceiling(), 12_288);

        thread::scope(|s| -> anyhow::Result<()> {
            let receiver = s.spawn(|| -> crate::Result<TransferStats> {
                let b = &mut b;
                b.as_rdma_mut().unwrap().establish(Role::Server, false)?;
                bulk.recv(b, LEN, 0)
            });
            a.as_rdma_mut().unwrap().establish(Role::Client, false)?;
            let sent = bulk.send(&mut a, LEN, 0)?;
            assert_eq!(sent.chunks, 9);
            assert_eq!(receiver.join().unwrap()?.bytes, LEN);
            Ok(())
        })?;

        assert_eq!(b.buffer().unwrap(), &pattern(LEN)[..]);
        Ok(())
    }

    #[test]
    fn region_is_checked_up_front() -> anyhow::Result<()> {
        let (x, _y) = UnixStream::pair()?;
        let mut comm = Communicator::stream(x);
        let bulk = BulkTransfer::new(4)?;
        assert!(matches!(bulk.send(&mut comm, 8, 0), Err(Error::NoBuffer { .. })));

        comm.set_buffer(vec![0u8; 8].into_boxed_slice())?;
        assert!(matches!(bulk.send(&mut comm, 8, 1), Err(Error::OutOfBounds { .. })));
        assert!(matches!(BulkTransfer::new(0), Err(Error::InvalidConfig(_))));
        Ok(())
    }
}
