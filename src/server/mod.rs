//! The serving side: listening socket, client table, and the per-connection
//! lifecycle engine.
//!
//! # Connection lifecycle
//!
//! Each accepted connection walks through these phases:
//!
//! ```text
//!   BeginReadPassword ──► ReadPassword
//!          │                   │
//!          ▼                   ▼
//!      ReadHeader ◄────────────┘
//!          │
//!          ├──────────────► BufferBody (PASSENGER_BUFFERING)
//!          │                   │
//!          ▼                   │
//!     CheckoutSession ◄────────┘
//!          │
//!          ├──────────────► WriteSimpleResponse (checkout failed)
//!          ▼
//!     SendHeaderToApp
//!          │
//!          ▼
//!      ForwardBody ────────► Disconnected
//! ```
//!
//! Any internal error before `ForwardBody` falls into
//! `WriteSimpleResponse`, which renders a 500 page and never regresses; the
//! connection then ends once the output pipe drains.

pub mod client;
pub mod handler;
pub mod listener;

pub use client::{Client, Disconnect, Phase, PhaseCell};
pub use handler::RequestHandler;
pub use listener::{ListenAddr, Listener, Socket};
