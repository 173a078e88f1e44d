//! # rollwal
//!
//! Durable write path for a metrics time-series store.
//!
//! rollwal combines a segmented write-ahead log with an in-memory, sharded
//! rollup store. Every accepted batch is applied to memory, which assigns it
//! a log sequence number (LSN), and then logged under that same LSN.
//! Periodic snapshots of the rollup store let the log be truncated; on
//! restart the latest snapshot is loaded and only the log tail past it is
//! replayed.
//!
//! ## Key Properties
//!
//! - One strictly increasing LSN shared by the rollup store and the log
//! - CRC32C-verified records; a torn tail is repaired, corruption elsewhere is fatal
//! - Secondly, minutely and hourly rollups with mergeable quantile sketches
//! - Lock-free shard reads through a copy-on-write shard map
//! - Debounced background snapshots with quarantine-then-delete log cleanup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rollwal::{Collaborators, EngineConfig, WriteContext, WriteCoordinator};
//! use rollwal::query::Slice;
//! use rollwal::rollup::Resolution;
//! use rollwal::stats::Aggregation;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::with_root("./metrics");
//! let coordinator = WriteCoordinator::open(config, Collaborators::local("local", 16))?;
//!
//! let now = 1_700_000_000_000;
//! let lsn = coordinator.ingest(
//!     &WriteContext::default(),
//!     "http.requests",
//!     &[now, now + 1_000],
//!     &[12.0, 15.0],
//! )?;
//! println!("logged at LSN {lsn}");
//!
//! let slice = Slice::new("http.requests", now, now + 1_000, Aggregation::Sum, Resolution::Minutely);
//! let result = coordinator.scan(&slice)?;
//! for (ts, value) in result.timestamps.iter().zip(&result.values) {
//!     println!("{ts}: {value}");
//! }
//!
//! coordinator.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: Write coordinator, recovery and checkpoint scheduling
//! - [`shard_map`]: Sharded rollup store and snapshot format
//! - [`rollup`]: Per-shard series store and resolutions
//! - [`stats`]: Mergeable statistics and quantile sketch
//! - [`query`]: Query processor over rollups
//! - [`wal`]: Segments, framing, batching, cleaning and replay
//! - [`cluster`]: Clock, routing, cluster gate and uploader traits
//! - [`config`]: Engine configuration
//! - [`error`]: Error types

mod codec;

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod query;
pub mod rollup;
pub mod shard_map;
pub mod stats;
pub mod wal;

// Re-export primary API types at crate root for convenience.
pub use config::EngineConfig;
pub use coordinator::{Collaborators, CoordinatorState, WriteCoordinator};
pub use error::{Result, RollwalError};
pub use query::{QueryProcessor, QueryResult, Slice};
pub use rollup::{Resolution, RollupSeries};
pub use shard_map::{RollupBackend, ShardMap, WriteContext};
pub use stats::{Aggregation, Statistics};
