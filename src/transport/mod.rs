//! The native transfer library boundary.
//!
//! A [`Transport`] allocates [`Connection`]s; a connection accepts options one
//! at a time and, once performed, yields the payload as a stream of chunks.
//! Transfer handles only ever talk to these two traits.
//!
//! [`NetTransport`] is the real network backend. It caps the number of live
//! connections and dispatches on URL scheme:
//!
//! ```text
//! http, https  → http.rs  (reqwest, streamed body)
//! imap, imaps  → imap.rs  (async-imap over tokio + native-tls)
//! ```
//!
//! [`scripted::ScriptedTransport`] is an in-memory backend with the same
//! contract, for tests and dry runs.

pub mod http;
pub mod imap;
pub mod scripted;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use url::Url;

use crate::xfer::error::{TransferCode, TransportFault};
use crate::xfer::options::{OptionKey, OptionValue};

/// Payload chunks in receipt order, or the fault that ended the transfer.
pub type ChunkStream<'a> = BoxStream<'a, Result<Bytes, TransportFault>>;

/// Allocates connection resources.
pub trait Transport: Send + Sync {
    /// Allocate a fresh connection. `Err` carries the reason allocation failed.
    fn open(&self) -> Result<Box<dyn Connection>, String>;
}

/// One exclusively owned transfer resource.
pub trait Connection: Send {
    /// Apply a single option. `Err` carries the reason it was refused.
    fn setopt(&mut self, key: OptionKey, value: &OptionValue) -> Result<(), String>;

    /// Run the transfer with the options applied so far.
    fn perform(&mut self) -> ChunkStream<'_>;
}

/// Applied request settings for the network backends.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub url: Option<Url>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub custom_request: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub follow_location: bool,
    pub fail_on_error: bool,
    pub verbose: bool,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            custom_request: None,
            user_agent: None,
            timeout: None,
            connect_timeout: None,
            follow_location: false,
            fail_on_error: true,
            verbose: false,
        }
    }
}

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "imap", "imaps"];

impl RequestSettings {
    /// Validate and store one option value.
    pub fn apply(&mut self, key: OptionKey, value: &OptionValue) -> Result<(), String> {
        match (key, value) {
            (OptionKey::Url, OptionValue::Str(raw)) => {
                let url = Url::parse(raw).map_err(|e| format!("malformed URL {raw:?}: {e}"))?;
                if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
                    return Err(format!("unsupported protocol: {}", url.scheme()));
                }
                if url.host_str().is_none_or(str::is_empty) {
                    return Err(format!("URL has no host: {raw}"));
                }
                self.url = Some(url);
            }
            (OptionKey::Username, OptionValue::Str(s)) => {
                self.username = Some(single_line(key, s)?.to_string());
            }
            (OptionKey::Password, OptionValue::Str(s)) => {
                self.password = Some(single_line(key, s)?.to_string());
            }
            (OptionKey::CustomRequest, OptionValue::Str(s)) => {
                let s = single_line(key, s)?.trim();
                self.custom_request = (!s.is_empty()).then(|| s.to_string());
            }
            (OptionKey::UserAgent, OptionValue::Str(s)) => {
                self.user_agent = Some(single_line(key, s)?.to_string());
            }
            (OptionKey::TimeoutMs, OptionValue::Int(ms)) => {
                self.timeout = millis(key, *ms)?;
            }
            (OptionKey::ConnectTimeoutMs, OptionValue::Int(ms)) => {
                self.connect_timeout = millis(key, *ms)?;
            }
            (OptionKey::MaxFileSize, OptionValue::Int(n)) => {
                if *n < 0 {
                    return Err(format!("{key} must not be negative"));
                }
            }
            (OptionKey::FollowLocation, OptionValue::Int(v)) => self.follow_location = *v != 0,
            (OptionKey::FailOnError, OptionValue::Int(v)) => self.fail_on_error = *v != 0,
            (OptionKey::Verbose, OptionValue::Int(v)) => self.verbose = *v != 0,
            // Consumed by the handle, not by the network layer.
            (OptionKey::WriteData, OptionValue::Pointer(_))
            | (OptionKey::WriteFunction, OptionValue::Callback(_)) => {}
            (key, value) => {
                return Err(format!("{key} cannot take a {} value", value.kind()));
            }
        }
        Ok(())
    }
}

fn single_line<'a>(key: OptionKey, s: &'a str) -> Result<&'a str, String> {
    if s.contains(['\r', '\n', '\0']) {
        Err(format!("{key} must be a single line"))
    } else {
        Ok(s)
    }
}

fn millis(key: OptionKey, ms: i64) -> Result<Option<Duration>, String> {
    match u64::try_from(ms) {
        Ok(0) => Ok(None),
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(_) => Err(format!("{key} must not be negative")),
    }
}

/// A stream that yields a single fault.
pub(crate) fn fail_stream<'a>(fault: TransportFault) -> ChunkStream<'a> {
    stream::once(async move { Err(fault) }).boxed()
}

/// Network transport backed by reqwest (HTTP) and async-imap (IMAP).
pub struct NetTransport {
    live: Arc<AtomicUsize>,
    max_connections: usize,
}

impl NetTransport {
    pub fn new(max_connections: usize) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Number of connections currently allocated.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl Transport for NetTransport {
    fn open(&self) -> Result<Box<dyn Connection>, String> {
        let max = self.max_connections;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| format!("connection limit reached (max {max})"))?;
        Ok(Box::new(NetConnection {
            settings: RequestSettings::default(),
            _slot: Slot(Arc::clone(&self.live)),
        }))
    }
}

/// Releases a connection slot when dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct NetConnection {
    settings: RequestSettings,
    _slot: Slot,
}

impl Connection for NetConnection {
    fn setopt(&mut self, key: OptionKey, value: &OptionValue) -> Result<(), String> {
        self.settings.apply(key, value)
    }

    fn perform(&mut self) -> ChunkStream<'_> {
        let Some(url) = &self.settings.url else {
            return fail_stream(TransportFault::new(
                TransferCode::UrlMalformed,
                "no URL set",
            ));
        };
        match url.scheme() {
            "http" | "https" => http::perform(&self.settings),
            "imap" | "imaps" => imap::perform(&self.settings),
            other => fail_stream(TransportFault::new(
                TransferCode::UnsupportedProtocol,
                format!("unsupported protocol: {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validation() {
        let mut s = RequestSettings::default();
        assert!(s
            .apply(OptionKey::Url, &"imaps://mail.example.com/INBOX".into())
            .is_ok());
        assert!(s.apply(OptionKey::Url, &"ftp://example.com".into()).is_err());
        assert!(s.apply(OptionKey::Url, &"not a url".into()).is_err());
        assert!(s.apply(OptionKey::TimeoutMs, &OptionValue::Int(-1)).is_err());
        assert!(s
            .apply(OptionKey::CustomRequest, &"SEARCH ALL\r\nA LOGOUT".into())
            .is_err());
        assert!(s.apply(OptionKey::FollowLocation, &OptionValue::Int(2)).is_ok());
        assert!(s.follow_location);
        assert!(s.apply(OptionKey::TimeoutMs, &OptionValue::Int(0)).is_ok());
        assert_eq!(s.timeout, None);
    }

    #[test]
    fn test_connection_limit() {
        let transport = NetTransport::new(2);
        let a = transport.open().unwrap();
        let b = transport.open().unwrap();
        assert!(transport.open().is_err());
        assert_eq!(transport.live_connections(), 2);
        drop(a);
        assert_eq!(transport.live_connections(), 1);
        let _c = transport.open().unwrap();
        drop(b);
        assert_eq!(transport.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_perform_without_url_fails() {
        let transport = NetTransport::new(1);
        let mut conn = transport.open().unwrap();
        let first = conn.perform().next().await.unwrap();
        assert_eq!(first.unwrap_err().code, TransferCode::UrlMalformed);
    }
}
