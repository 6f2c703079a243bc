//! RDMA functionalities.

pub mod gid;
pub mod mr;
pub mod perm;
pub mod poller;
pub mod port;
pub mod provider;
pub mod qp;
pub mod type_alias;
pub mod wc;
pub mod wire;
