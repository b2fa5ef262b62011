//! Transfer engine: typed options, handles, and the session manager.
//!
//! ```text
//! TransferRequest ─submit─▶ SessionManager ─run_all─▶ TransferHandle ─▶ Connection
//!                                │                        │
//!                                └── ProgressEvent ◀──────┘
//! ```

pub mod error;
pub mod handle;
pub mod hasher;
pub mod manager;
pub mod options;
pub mod types;
