//! NFSv4.0/4.1 server state core
//!
//! This crate implements the state machinery of an NFSv4 server: client
//! registration, sessions with exactly-once slot semantics, open and lock
//! state, leases, and COMPOUND dispatch. Wire decoding and the RPC transport
//! live outside; requests arrive as decoded [`CompoundArgs`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  transport   │  decoded CompoundArgs + RpcCall
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │  NfsServer   │  execute_compound / dispatch
//! │  - ops       │
//! │  - registry  │  StateHandler -> Nfs4Client -> sessions, states
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐   ┌───────────────┐
//! │ VirtualFile- │   │  LockManager  │
//! │ System       │   │ (nfs4d-common)│
//! └──────────────┘   └───────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod nfs4;
pub mod rpc;
pub mod server;
pub mod vfs;

pub use config::{ConfigError, NfsConfig};
pub use error::{NfsError, NfsResult, NfsStatus};
pub use logging::{init_logging, LogLevel, LoggingConfig};
pub use nfs4::compound::{CompoundArgs, CompoundRes, Nfs4OpArgs, Nfs4OpRes};
pub use rpc::{RpcCall, RpcCredential};
pub use server::NfsServer;
pub use vfs::{MemoryFs, VirtualFileSystem};
