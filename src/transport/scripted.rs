//! In-memory transport with scripted responses.
//!
//! Each URL maps to a [`Script`]: the chunks to deliver, an optional fault,
//! and an optional delay before each one. Unknown URLs fail with
//! `COULDNT_RESOLVE_HOST`. The transport counts allocations and the number of
//! transfers performing at once, so callers can check concurrency limits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};

use super::{fail_stream, ChunkStream, Connection, Transport};
use crate::xfer::error::{TransferCode, TransportFault};
use crate::xfer::options::{OptionKey, OptionSet, OptionValue};

/// Scripted response for one URL.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Result<Bytes, TransportFault>>,
    delay: Option<Duration>,
}

impl Script {
    /// Deliver the given chunks, then complete.
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            steps: chunks.into_iter().map(|c| Ok(c.into())).collect(),
            delay: None,
        }
    }

    /// Fail immediately.
    pub fn failing(code: TransferCode, message: &str) -> Self {
        Self::default().then_fail(code, message)
    }

    /// Fail after the chunks scripted so far.
    #[must_use]
    pub fn then_fail(mut self, code: TransferCode, message: &str) -> Self {
        self.steps.push(Err(TransportFault::new(code, message)));
        self
    }

    /// Wait this long before delivering each step.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct Stats {
    opened: AtomicUsize,
    live: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Scripted stand-in for the network transport.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    routes: Arc<HashMap<String, Script>>,
    rejected: Arc<HashSet<OptionKey>>,
    max_connections: Option<usize>,
    stats: Arc<Stats>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn route(mut self, url: &str, script: Script) -> Self {
        Arc::make_mut(&mut self.routes).insert(url.to_string(), script);
        self
    }

    /// Refuse every value for `key` at apply time.
    #[must_use]
    pub fn reject_option(mut self, key: OptionKey) -> Self {
        Arc::make_mut(&mut self.rejected).insert(key);
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Connections allocated over the transport's lifetime.
    pub fn opened(&self) -> usize {
        self.stats.opened.load(Ordering::Acquire)
    }

    /// Connections currently allocated.
    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::Acquire)
    }

    /// Highest number of transfers that were performing at the same time.
    pub fn peak_active(&self) -> usize {
        self.stats.peak_active.load(Ordering::Acquire)
    }
}

impl Transport for ScriptedTransport {
    fn open(&self) -> Result<Box<dyn Connection>, String> {
        if let Some(max) = self.max_connections {
            self.stats
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .map_err(|_| format!("connection limit reached (max {max})"))?;
        } else {
            self.stats.live.fetch_add(1, Ordering::AcqRel);
        }
        self.stats.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ScriptedConnection {
            routes: Arc::clone(&self.routes),
            rejected: Arc::clone(&self.rejected),
            options: OptionSet::new(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedConnection {
    routes: Arc<HashMap<String, Script>>,
    rejected: Arc<HashSet<OptionKey>>,
    options: OptionSet,
    stats: Arc<Stats>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Connection for ScriptedConnection {
    fn setopt(&mut self, key: OptionKey, value: &OptionValue) -> Result<(), String> {
        if self.rejected.contains(&key) {
            return Err(format!("{key} not supported by this transport"));
        }
        self.options.set(key, value.clone()).map_err(|e| e.to_string())
    }

    fn perform(&mut self) -> ChunkStream<'_> {
        let Some(url) = self.options.get_str(OptionKey::Url) else {
            return fail_stream(TransportFault::new(TransferCode::UrlMalformed, "no URL set"));
        };
        let Some(script) = self.routes.get(url) else {
            return fail_stream(TransportFault::new(
                TransferCode::CouldntResolveHost,
                format!("no route for {url}"),
            ));
        };

        let steps: VecDeque<_> = script.steps.iter().cloned().collect();
        let delay = script.delay;
        let active = Active::enter(Arc::clone(&self.stats));
        stream::unfold((steps, active), move |(mut steps, active)| async move {
            let step = steps.pop_front()?;
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Some((step, (steps, active)))
        })
        .boxed()
    }
}

/// Counts a performing transfer until the stream is dropped.
struct Active(Arc<Stats>);

impl Active {
    fn enter(stats: Arc<Stats>) -> Self {
        let now = stats.active.fetch_add(1, Ordering::AcqRel) + 1;
        stats.peak_active.fetch_max(now, Ordering::AcqRel);
        Self(stats)
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_plays_in_order() {
        let transport = ScriptedTransport::new().route(
            "mem://a",
            Script::chunks(["one", "two"]).then_fail(TransferCode::RecvError, "reset"),
        );
        let mut conn = transport.open().unwrap();
        conn.setopt(OptionKey::Url, &"mem://a".into()).unwrap();
        let steps: Vec<_> = conn.perform().collect().await;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].as_ref().unwrap(), &Bytes::from("one"));
        assert_eq!(steps[1].as_ref().unwrap(), &Bytes::from("two"));
        assert_eq!(steps[2].as_ref().unwrap_err().code, TransferCode::RecvError);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let transport = ScriptedTransport::new();
        let mut conn = transport.open().unwrap();
        conn.setopt(OptionKey::Url, &"mem://nowhere".into()).unwrap();
        let first = conn.perform().next().await.unwrap();
        assert_eq!(first.unwrap_err().code, TransferCode::CouldntResolveHost);
    }

    #[test]
    fn test_limits_and_rejections() {
        let transport = ScriptedTransport::new()
            .max_connections(1)
            .reject_option(OptionKey::UserAgent);
        let mut conn = transport.open().unwrap();
        assert!(transport.open().is_err());
        assert!(conn.setopt(OptionKey::UserAgent, &"x".into()).is_err());
        assert!(conn.setopt(OptionKey::Url, &"mem://a".into()).is_ok());
        drop(conn);
        assert_eq!(transport.live(), 0);
        assert_eq!(transport.opened(), 1);
    }
}
