//! Worker-side functionality
//!
//! This module implements the application pool the core checks sessions out
//! of, and the session/dispatch framing toward a worker.

pub mod pool;
pub mod session;

pub use pool::{CheckoutError, PoolOptions, SessionSource, SpawnFailure, Worker, WorkerPool};
pub use session::{build_dispatch_frame, Session, WorkerAddr, WorkerIo};
