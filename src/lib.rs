#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! mailxfer library: managed transfer sessions for mail retrieval.
//!
//! - `xfer`: typed options, transfer handles, the session manager, digests
//! - `transport`: the connection boundary, plus network and scripted backends
//! - `mail`: IMAP mailbox operations built on transfer requests
//! - `config`: configuration loading
//!
//! ```text
//! xfer/
//!   options.rs     OptionKey / OptionValue registry, kind checks
//!   handle.rs      TransferHandle lifecycle, chunk delivery, cancellation
//!   manager.rs     SessionManager (submit, run_all, results, cancel)
//!   hasher.rs      SHA-256 / MD5 digests
//! transport/
//!   mod.rs         Transport / Connection traits, NetTransport
//!   http.rs        reqwest backend
//!   imap.rs        IMAP backend (async-imap, tokio + native-tls)
//!   scripted.rs    in-memory backend
//! mail/
//!   request.rs     request builders, EXISTS / SEARCH parsers
//!   client.rs      MailClient
//! ```

pub mod config;
pub mod mail;
pub mod transport;
pub mod util;
pub mod xfer;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use mail::{MailClient, MailServer};
pub use transport::{NetTransport, Transport};
pub use xfer::error::XferError;
pub use xfer::handle::{CancelHandle, TransferHandle};
pub use xfer::manager::SessionManager;
pub use xfer::options::{OptionKey, OptionValue};
pub use xfer::types::{HandleState, ManagerConfig, TransferRequest, TransferResult};
