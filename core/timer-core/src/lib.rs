//! # timer-core
//!
//! Core library for the ticket timer, providing the time accounting shared
//! by all clients (daemon, CLI).
//!
//! ## Design Principles
//!
//! - **Store is the truth**: The engine keeps no state between calls; every
//!   operation reads the store, mutates, and writes back the keys it touched.
//! - **One running ticket**: Starting a ticket banks whichever one was running.
//! - **Totals add up**: A ticket's total always equals the sum of its phase
//!   buckets, with [`UNPHASED_BUCKET`] catching time that had no phase.
//! - **Graceful degradation**: Missing files and unknown ticket details fall
//!   back to defaults and placeholders, not errors.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use timer_core::{FileStore, StoragePaths, SystemClock, TimeEngine, TimerConfig};
//!
//! let paths = StoragePaths::from_env()?;
//! let engine = TimeEngine::new(
//!     Arc::new(FileStore::new(paths.root().join("state.json"))),
//!     Arc::new(SystemClock),
//!     TimerConfig::default().engine,
//! );
//! engine.start("101").await?;
//! let report = engine.report().await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod report;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

// Re-export commonly used items at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use engine::TimeEngine;
pub use error::{Result, TimerError};
pub use lifecycle::{on_startup, on_teardown, TeardownReason};
pub use observer::{BoardEvent, BoardSource, Debouncer, PhaseFact, PhaseObserver, RetrySchedule};
pub use report::{TicketInfo, TicketInfoSource, TicketRow, TimerReport};
pub use storage::*;
pub use store::{FileStore, MemoryStore, StateStore, StoreKey, StoreMap, TimerState};
pub use sync::{OriginId, SyncHub, SyncNotifier, SyncSignal, SyncSubscription};
pub use types::*;
