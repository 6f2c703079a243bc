use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::rdma::port::PortMtu;
use crate::rdma::provider::QpCaps;
use crate::rdma::type_alias::*;

/// Default chunk ceiling for bulk transfers: 1 GiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 30;

/// Communicator configuration.
///
/// Read from the `[rrcomm]` table of a TOML file:
///
/// ```toml
/// [rrcomm]
/// device = "mlx5_.*"
/// gid_index = 3
/// path_mtu = 4096
/// poll_timeout_ms = 5000
/// ```
///
/// Omitted keys keep their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommConfig {
    /// Device name, or a regular expression matching exactly one device.
    pub device: String,

    pub port_num: PortNum,
    pub gid_index: GidIndex,

    /// Completion queue depth.
    pub cq_depth: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,

    /// Path MTU in bytes, capped by the port's active MTU. Both peers must
    /// agree on it, since descriptors do not carry it. Set to `None` to use
    /// the active MTU as is.
    pub path_mtu: Option<PortMtu>,

    pub min_rnr_timer: u8,

    /// Local ACK timeout exponent (4.096 us * 2^timeout).
    pub timeout: u8,

    /// Transport retries; 7 is the maximum.
    pub retry_cnt: u8,

    /// RNR retries; 7 means retry forever.
    pub rnr_retry: u8,

    pub max_rd_atomic: u8,
    pub hop_limit: u8,

    /// Ceiling of a single bulk transfer chunk, in bytes.
    pub chunk_size: usize,

    /// Give up busy-polling after this many milliseconds. Omit to wait forever.
    pub poll_timeout_ms: Option<u64>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            device: "mlx5_0".to_owned(),
            port_num: 1,
            gid_index: 0,
            cq_depth: 16,
            max_send_wr: 8,
            max_recv_wr: 8,
            path_mtu: Some(PortMtu::Mtu1024),
            min_rnr_timer: 12,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
            hop_limit: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_timeout_ms: None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    rrcomm: Option<CommConfig>,
}

impl CommConfig {
    /// Create the default configuration for the given device and GID index.
    pub fn for_device(device: &str, gid_index: GidIndex) -> Self {
        Self {
            device: device.to_owned(),
            gid_index,
            ..Default::default()
        }
    }

    /// Parse the `[rrcomm]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(toml_str).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let config = file
            .rrcomm
            .ok_or_else(|| Error::InvalidConfig("rrcomm configuration not found".to_owned()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the `[rrcomm]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let toml_str = fs::read_to_string(path.as_ref())
            .map_err(|source| Error::Io { op: "load_toml", source })?;
        Self::from_toml_str(&toml_str)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));
        if self.device.is_empty() {
            return fail("device name is empty".to_owned());
        }
        if self.port_num == 0 {
            return fail("port numbers start at 1".to_owned());
        }
        if self.cq_depth == 0 || self.max_send_wr == 0 || self.max_recv_wr == 0 {
            return fail("queue depths must be positive".to_owned());
        }
        let Some(wr_total) = self.max_send_wr.checked_add(self.max_recv_wr) else {
            return fail(format!(
                "max_send_wr ({}) + max_recv_wr ({}) overflows",
                self.max_send_wr, self.max_recv_wr
            ));
        };
        if self.cq_depth < wr_total {
            log::warn!(
                "cq_depth {} is below max_send_wr + max_recv_wr = {}",
                self.cq_depth,
                wr_total
            );
        }
        if self.retry_cnt > 7 || self.rnr_retry > 7 {
            return fail(format!(
                "retry_cnt ({}) and rnr_retry ({}) must not exceed 7",
                self.retry_cnt, self.rnr_retry
            ));
        }
        if self.min_rnr_timer > 31 || self.timeout > 31 {
            return fail("min_rnr_timer and timeout are 5-bit values".to_owned());
        }
        if self.chunk_size == 0 {
            return fail("chunk_size must be positive".to_owned());
        }
        Ok(())
    }

    /// Queue capacities derived from this configuration.
    pub fn qp_caps(&self) -> QpCaps {
        QpCaps {
            cq_depth: self.cq_depth,
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }

    /// The busy-poll deadline.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CommConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port_num, 1);
        assert_eq!(config.cq_depth, 16);
        assert_eq!(config.max_send_wr, 8);
        assert_eq!((config.timeout, config.retry_cnt, config.rnr_retry), (14, 7, 7));
        assert_eq!(config.chunk_size, 1 << 30);
        assert_eq!(config.poll_timeout(), None);
        assert_eq!(config.path_mtu, Some(PortMtu::Mtu1024));
        assert_eq!(config.hop_limit, 1);
    }

    #[test]
    fn parse_partial_table() -> anyhow::Result<()> {
        let config = CommConfig::from_toml_str(
            r#"
            [rrcomm]
            device = "mlx5_.*"
            gid_index = 3
            path_mtu = 4096
            poll_timeout_ms = 250
            "#,
        )?;
        assert_eq!(config.device, "mlx5_.*");
        assert_eq!(config.gid_index, 3);
        assert_eq!(config.path_mtu, Some(PortMtu::Mtu4096));
        assert_eq!(config.poll_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.cq_depth, 16);
        Ok(())
    }

    #[test]
    fn reject_bad_values() {
        for doc in [
            "[other]\nx = 1",
            "[rrcomm]\nretry_cnt = 8",
            "[rrcomm]\nchunk_size = 0",
            "[rrcomm]\npath_mtu = 1500",
            "[rrcomm]\nbogus = true",
            "[rrcomm]\nmax_send_wr = 4294967295\nmax_recv_wr = 1",
        ] {
            assert!(
                matches!(CommConfig::from_toml_str(doc), Err(Error::InvalidConfig(_))),
                "accepted {:?}",
                doc
            );
        }
    }
}
