#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A native, async client driver for Cassandra-family columnar databases.
//!
//! A [`Session`] owns a [`cluster::Cluster`] and a [`pool::PoolManager`],
//! which owns [`pool::ConnectionPool`]s keyed by host address. Requests enter
//! through the `Session`, are routed according to a [`policy::load_balancing`]
//! query plan, and executed against a connection chosen from the target
//! pool by one of tokio's worker threads.

pub mod cloud;
pub mod cluster;
pub mod compression;
pub mod error;
pub mod event;
pub mod execution;
pub mod options;
pub mod policy;
pub mod pool;
pub mod protocol;
pub(crate) mod runtime;
mod session;

pub use error::{Error, ErrorKind, Result};
pub use session::Session;
