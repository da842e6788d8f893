//! Market-data replay fabric: in-memory broadcast with durable replay.
//!
//! # Overview
//!
//! One producer injects a stream of fixed-size messages; multiple
//! independent consumers observe it in parallel without ever blocking
//! the producer. A designated consumer persists the stream to an
//! append-only binary log, and any consumer that falls behind, crashes
//! or loses its state rebuilds by replaying that log and then rejoins
//! the live stream with no gap and no duplicate at the boundary.
//!
//! The moving parts:
//!
//! 1. A lock-free single-producer/multi-consumer ring
//!    ([`RingBuffer`]) addressed by sequence number, with seqlock
//!    overwrite detection
//! 2. An append-only log ([`LogWriter`] / [`LogReader`]) whose header
//!    is refreshed periodically so partial data survives a crash
//! 3. A replay engine ([`ReplayEngine`]) with continuity validation
//!    and a catch-up predicate
//! 4. The [`Recorder`] and [`Client`] workers tying them together,
//!    plus a synthetic [`Feed`] producer for test scenarios
//!
//! # Key properties
//!
//! - The producer never blocks: buffer-full is expressed as overwrite,
//!   detected by consumers, never as backpressure
//! - Consumers are fully independent; each keeps its own cursor
//! - Every recoverable anomaly (gap, overwrite, recovery cycle)
//!   increments a named counter and emits a structured log line
//! - After a crash-and-recover cycle, a client's accumulator matches
//!   what an uninterrupted run would have computed
//!
//! # Usage
//!
//! See `src/main.rs` for the orchestrator wiring a feed, a client and
//! a recorder over one shared ring, and the `tests` directory for
//! end-to-end recovery scenarios.

#![deny(missing_docs)]

pub mod affinity;
pub mod client;
pub mod disk;
pub mod feed;
pub mod recorder;
pub mod replay;
pub mod ring;

pub use client::{Client, ClientMetrics, ClientState, FaultKind};
pub use disk::reader::LogReader;
pub use disk::writer::LogWriter;
pub use disk::DiskError;
pub use feed::Feed;
pub use recorder::{Recorder, RecorderMetrics};
pub use replay::ReplayEngine;
pub use ring::spmc::RingBuffer;
pub use ring::{
    ConsumerCursor, Msg, ReadResult, Seq, CATCHUP_THRESHOLD, DEFAULT_RING_CAPACITY,
    DISK_BATCH_SIZE, INVALID_SEQ,
};

use once_cell::sync::OnceCell;

/// Guard ensuring the tracing subscriber is installed at most once.
static LOGGING: OnceCell<()> = OnceCell::new();

/// Install the process-wide tracing subscriber.
///
/// Safe to call from multiple places (binaries, tests); only the first
/// call installs anything. The filter honours `RUST_LOG` and defaults
/// to `info`. The core components only use logging for observability;
/// none of them require this to have been called.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    });
}
