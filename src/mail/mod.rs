//! Mailbox operations on top of the transfer engine.
//!
//! Every operation is an ordinary [`TransferRequest`](crate::xfer::types::TransferRequest)
//! against an `imap`/`imaps` URL, with the IMAP command carried in
//! `custom_request`. Responses are gathered through the write callback into a
//! [`ResponseBuffer`] and parsed here.
//!
//! All message numbers are UIDs: searches use `UID SEARCH`, flag changes use
//! `UID STORE`, and fetches use `;UID=n` URLs.

pub mod client;
pub mod request;

use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::xfer::options::UserData;

pub use client::{FetchedMessage, MailClient, MailError, MailboxInfo};

/// Characters escaped when a mailbox name goes into a URL path.
const MAILBOX_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b';')
    .add(b'?');

/// Account settings for one IMAP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServer {
    /// Host, optionally with `:port`.
    pub address: String,
    pub username: String,
    pub password: String,
    /// Searches only consider messages received on or after this date.
    pub since: NaiveDate,
    /// Mark messages `\Flagged` once they have been replied to.
    pub flag_replied: bool,
    /// Leave unread messages unread after fetching them.
    pub dont_touch_unread: bool,
    /// `imaps` when set, plain `imap` otherwise.
    pub tls: bool,
}

impl MailServer {
    fn scheme(&self) -> &'static str {
        if self.tls {
            "imaps"
        } else {
            "imap"
        }
    }

    /// URL of the server itself, no mailbox selected.
    pub fn server_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.address)
    }

    pub fn mailbox_url(&self, mailbox: &str) -> String {
        format!(
            "{}/{}",
            self.server_url(),
            utf8_percent_encode(mailbox, MAILBOX_PATH)
        )
    }

    /// URL of one message. UIDs start at 1.
    pub fn message_url(&self, mailbox: &str, uid: u32) -> String {
        format!("{};UID={uid}", self.mailbox_url(mailbox))
    }

    /// Search criterion restricting results to the `since` date.
    pub fn since_criterion(&self) -> String {
        format!("SINCE {}", self.since.format("%d-%b-%Y"))
    }
}

/// Message flags the client reads and changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Seen,
    Flagged,
}

impl Flag {
    /// Search keyword matching messages with the flag set.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Seen => "SEEN",
            Self::Flagged => "FLAGGED",
        }
    }

    /// Search keyword matching messages without the flag.
    pub fn reversed(self) -> &'static str {
        match self {
            Self::Seen => "UNSEEN",
            Self::Flagged => "UNFLAGGED",
        }
    }

    /// System flag name used by `STORE`.
    pub fn system_name(self) -> &'static str {
        match self {
            Self::Seen => "\\Seen",
            Self::Flagged => "\\Flagged",
        }
    }
}

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('\\').to_ascii_lowercase().as_str() {
            "seen" => Ok(Self::Seen),
            "flagged" => Ok(Self::Flagged),
            other => Err(format!("unknown flag: {other}")),
        }
    }
}

/// Accumulates response bytes handed to the write callback.
#[derive(Debug, Default)]
pub struct ResponseBuffer(Mutex<Vec<u8>>);

impl ResponseBuffer {
    pub fn append(&self, chunk: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// Take the bytes collected so far, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write callback that appends every chunk to the [`ResponseBuffer`] passed
/// as user data. Consumes nothing (failing the transfer) if the user data is
/// missing or of another type.
pub fn collect_into_buffer(chunk: &[u8], data: Option<&UserData>) -> usize {
    match data.and_then(|d| d.downcast_ref::<ResponseBuffer>()) {
        Some(buffer) => {
            buffer.append(chunk);
            chunk.len()
        }
        None => 0,
    }
}
