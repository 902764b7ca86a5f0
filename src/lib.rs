//! An asynchronous client for beanstalkd-compatible work queues.
//!
//! Three layers, each wrapping the one before:
//!
//! - [`Connection`]: one socket, commands pipelined through a driver task and
//!   answered strictly in order.
//! - [`ReconnectingClient`]: reconnects on connection loss, restores the tube
//!   in use and the watch list, and retries the failed operation once.
//! - [`Pool`]: shares reconnecting clients between many [`PoolSession`]s,
//!   each with its own tube and watch list.
//!
//! [`BulkProducer`] inserts batches of jobs over a dedicated connection.
pub mod bulk;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod parser;
pub mod pool;
pub mod reader;
pub mod session;
pub mod types;
mod util;

pub use bulk::BulkProducer;
pub use config::{Config, ConfigBuilder, DEFAULT_PORT};
pub use connection::{
    Connection, DEFAULT_PRIORITY, DEFAULT_TTR, DEFAULT_TUBE, MAX_JOB_SIZE,
};
pub use error::{Error, Result};
pub use parser::MAX_TUBE_NAME_LEN;
pub use pool::{Pool, PoolSession};
pub use session::{ReconnectingClient, SessionState};
pub use types::job::{Job, JobId, Reservation};
pub use types::states::JobStatus;
pub use types::stats::{JobStats, ServerStats, TubeStats};
