//! IMAP(S) transfers through an `async-imap` session on a tokio socket,
//! wrapped in native TLS for `imaps`.
//!
//! URL forms:
//!
//! ```text
//! imaps://host[:port]                     LIST "" *            (or the custom command)
//! imaps://host[:port]/MAILBOX             SELECT status lines  (or the custom command)
//! imaps://host[:port]/MAILBOX;UID=n       UID FETCH n BODY[]   (message body only)
//! ```
//!
//! A custom command's untagged response is delivered as the server sent it.
//! The dialogue runs on its own task and feeds the chunk stream through a
//! bounded channel; dropping the stream ends the session.

use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::Mailbox;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{fail_stream, ChunkStream, RequestSettings};
use crate::xfer::error::{TransferCode, TransportFault};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 16;

/// Server, mailbox and message addressed by an `imap`/`imaps` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub mailbox: Option<String>,
    pub uid: Option<u32>,
}

impl ImapTarget {
    pub fn from_url(url: &Url) -> Result<Self, TransportFault> {
        let tls = match url.scheme() {
            "imaps" => true,
            "imap" => false,
            other => {
                return Err(TransportFault::new(
                    TransferCode::UnsupportedProtocol,
                    format!("not an IMAP URL: {other}"),
                ))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| malformed(format!("no host in {url}")))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 993 } else { 143 });

        let mut parts = url.path().trim_start_matches('/').split(';');
        let mailbox = parts
            .next()
            .filter(|m| !m.is_empty())
            .map(|m| percent_decode_str(m).decode_utf8_lossy().into_owned());

        let mut uid = None;
        for param in parts {
            let (name, value) = param
                .split_once('=')
                .ok_or_else(|| malformed(format!("bad URL parameter {param:?}")))?;
            if name.eq_ignore_ascii_case("UID") {
                let parsed = value
                    .parse::<u32>()
                    .ok()
                    .filter(|u| *u > 0)
                    .ok_or_else(|| malformed(format!("bad UID {value:?}")))?;
                uid = Some(parsed);
            }
        }
        if uid.is_some() && mailbox.is_none() {
            return Err(malformed("UID given without a mailbox"));
        }

        Ok(Self {
            host,
            port,
            tls,
            mailbox,
            uid,
        })
    }
}

fn malformed(message: impl Into<String>) -> TransportFault {
    TransportFault::new(TransferCode::UrlMalformed, message)
}

pub(crate) fn perform(settings: &RequestSettings) -> ChunkStream<'static> {
    let target = match settings.url.as_ref() {
        Some(url) => ImapTarget::from_url(url),
        None => Err(malformed("no URL set")),
    };
    let target = match target {
        Ok(t) => t,
        Err(fault) => return fail_stream(fault),
    };

    let settings = settings.clone();
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(async move {
        let sink = Sink { tx };
        if let Err(fault) = run(&target, &settings, &sink).await {
            let _ = sink.tx.send(Err(fault)).await;
        }
    });

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

async fn run(
    target: &ImapTarget,
    settings: &RequestSettings,
    sink: &Sink,
) -> Result<(), TransportFault> {
    let timeout = settings.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let tcp = connect(target, timeout).await?;
    if !target.tls {
        return dialogue(tcp, target, settings, sink).await;
    }

    let connector = native_tls::TlsConnector::new()
        .map_err(|e| TransportFault::new(TransferCode::SslConnectError, e.to_string()))?;
    let tls = tokio::time::timeout(
        timeout,
        tokio_native_tls::TlsConnector::from(connector).connect(&target.host, tcp),
    )
    .await
    .map_err(|_| TransportFault::new(TransferCode::OperationTimedout, "TLS handshake timed out"))?
    .map_err(|e| TransportFault::new(TransferCode::SslConnectError, e.to_string()))?;
    dialogue(tls, target, settings, sink).await
}

async fn connect(target: &ImapTarget, timeout: Duration) -> Result<TcpStream, TransportFault> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| {
            TransportFault::new(
                TransferCode::CouldntResolveHost,
                format!("{}: {e}", target.host),
            )
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportFault::new(
            TransferCode::CouldntResolveHost,
            format!("{}: no addresses", target.host),
        ));
    }

    tokio::time::timeout(timeout, connect_any(&addrs))
        .await
        .map_err(|_| {
            TransportFault::new(
                TransferCode::OperationTimedout,
                format!("connect to {}:{} timed out", target.host, target.port),
            )
        })?
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, TransportFault> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(format!("{addr}: {e}")),
        }
    }
    Err(TransportFault::new(
        TransferCode::CouldntConnect,
        last_err.unwrap_or_else(|| "no address to connect to".to_string()),
    ))
}

/// Greeting, login, then the request the URL and settings call for.
async fn dialogue<T>(
    stream: T,
    target: &ImapTarget,
    settings: &RequestSettings,
    sink: &Sink,
) -> Result<(), TransportFault>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let mut client = async_imap::Client::new(stream);
    match client.read_response().await {
        Some(Ok(_greeting)) => {}
        Some(Err(e)) => return Err(TransportFault::new(TransferCode::RecvError, e.to_string())),
        None => {
            return Err(TransportFault::new(
                TransferCode::RecvError,
                "connection closed before greeting",
            ))
        }
    }

    let Some(user) = settings.username.as_deref() else {
        return Err(TransportFault::new(
            TransferCode::LoginDenied,
            "IMAP requires a username",
        ));
    };
    let pass = settings.password.as_deref().unwrap_or("");
    if settings.verbose {
        debug!(user, "IMAP > LOGIN");
    }
    let mut session = client
        .login(user, pass)
        .await
        .map_err(|(e, _)| refused(e, TransferCode::LoginDenied, "LOGIN"))?;

    let custom = settings.custom_request.as_deref();
    match &target.mailbox {
        Some(mailbox) => {
            if settings.verbose {
                debug!(mailbox = %mailbox, "IMAP > SELECT");
            }
            let status = session
                .select(mailbox)
                .await
                .map_err(|e| refused(e, TransferCode::RemoteFileNotFound, "SELECT"))?;

            if let Some(cmd) = custom {
                run_custom(&mut session, cmd, settings.verbose, sink).await?;
            } else if let Some(uid) = target.uid {
                if settings.verbose {
                    debug!(uid, "IMAP > UID FETCH");
                }
                let fetches = session
                    .uid_fetch(uid.to_string(), "BODY[]")
                    .await
                    .map_err(|e| refused(e, TransferCode::QuoteError, "UID FETCH"))?;
                let mut fetches = std::pin::pin!(fetches);
                let mut found = false;
                while let Some(fetch) = fetches.next().await {
                    let fetch = fetch.map_err(|e| refused(e, TransferCode::QuoteError, "UID FETCH"))?;
                    if let Some(body) = fetch.body() {
                        found = true;
                        sink.send_all(body).await?;
                    }
                }
                if !found {
                    return Err(TransportFault::new(
                        TransferCode::RemoteFileNotFound,
                        format!("no message with UID {uid} in {mailbox}"),
                    ));
                }
            } else {
                sink.send(mailbox_status(&status)).await?;
            }
        }
        None => {
            run_custom(&mut session, custom.unwrap_or("LIST \"\" *"), settings.verbose, sink).await?;
        }
    }

    if let Err(e) = session.logout().await {
        debug!(error = %e, "LOGOUT failed");
    }
    Ok(())
}

async fn run_custom<T>(
    session: &mut async_imap::Session<T>,
    cmd: &str,
    verbose: bool,
    sink: &Sink,
) -> Result<(), TransportFault>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    if verbose {
        debug!(command = cmd, "IMAP >");
    }
    let response = session
        .run_command_and_read_response(cmd)
        .await
        .map_err(|e| refused(e, TransferCode::QuoteError, cmd))?;
    sink.send_all(&response).await
}

/// Map a session error; a NO or BAD reply becomes `refusal`.
fn refused(err: ImapError, refusal: TransferCode, what: &str) -> TransportFault {
    match err {
        ImapError::No(text) | ImapError::Bad(text) => {
            TransportFault::new(refusal, format!("{what} failed: {text}"))
        }
        ImapError::Io(e) => TransportFault::new(TransferCode::RecvError, format!("{what}: {e}")),
        ImapError::Parse(e) => {
            TransportFault::new(TransferCode::WeirdServerReply, format!("{what}: {e}"))
        }
        other => TransportFault::new(TransferCode::RecvError, format!("{what}: {other}")),
    }
}

/// The counts a SELECT reported, as untagged status lines.
fn mailbox_status(mailbox: &Mailbox) -> String {
    let mut out = format!("* {} EXISTS\r\n* {} RECENT\r\n", mailbox.exists, mailbox.recent);
    if let Some(unseen) = mailbox.unseen {
        let _ = write!(out, "* OK [UNSEEN {unseen}]\r\n");
    }
    if let Some(validity) = mailbox.uid_validity {
        let _ = write!(out, "* OK [UIDVALIDITY {validity}]\r\n");
    }
    if let Some(next) = mailbox.uid_next {
        let _ = write!(out, "* OK [UIDNEXT {next}]\r\n");
    }
    out
}

struct Sink {
    tx: mpsc::Sender<Result<Bytes, TransportFault>>,
}

impl Sink {
    async fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportFault> {
        self.tx
            .send(Ok(data.into()))
            .await
            .map_err(|_| TransportFault::new(TransferCode::WriteError, "transfer consumer went away"))
    }

    /// Deliver `data` in bounded chunks.
    async fn send_all(&self, data: &[u8]) -> Result<(), TransportFault> {
        for part in data.chunks(CHUNK_SIZE) {
            self.send(Bytes::copy_from_slice(part)).await?;
        }
        Ok(())
    }
}

/// IMAP quoted string.
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::options::{OptionKey, OptionValue};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn target(url: &str) -> Result<ImapTarget, TransportFault> {
        ImapTarget::from_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_target_forms() {
        let t = target("imaps://mail.example.com").unwrap();
        assert_eq!(t.port, 993);
        assert!(t.tls);
        assert_eq!(t.mailbox, None);

        let t = target("imap://mail.example.com:1143/Sent%20Items").unwrap();
        assert_eq!(t.port, 1143);
        assert!(!t.tls);
        assert_eq!(t.mailbox.as_deref(), Some("Sent Items"));

        let t = target("imaps://mail.example.com/INBOX;UID=42").unwrap();
        assert_eq!(t.mailbox.as_deref(), Some("INBOX"));
        assert_eq!(t.uid, Some(42));
    }

    #[test]
    fn test_target_rejects_bad_uid() {
        assert!(target("imaps://mail.example.com/INBOX;UID=abc").is_err());
        assert!(target("imaps://mail.example.com/INBOX;UID=0").is_err());
        assert!(target("imaps://mail.example.com/;UID=3").is_err());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"pa"ss\w"#), r#""pa\"ss\\w""#);
    }

    /// Serve one scripted IMAP connection on loopback.
    async fn fake_server(accept_login: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut io = BufReader::new(stream);
            io.get_mut()
                .write_all(b"* OK fake IMAP ready\r\n")
                .await
                .unwrap();
            loop {
                let mut line = String::new();
                if io.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                let (tag, cmd) = line.trim_end().split_once(' ').unwrap();
                let reply = if cmd.starts_with("LOGIN") {
                    if accept_login {
                        format!("{tag} OK LOGIN completed\r\n")
                    } else {
                        format!("{tag} NO [AUTHENTICATIONFAILED] nope\r\n")
                    }
                } else if cmd.starts_with("SELECT \"Missing\"") {
                    format!("{tag} NO Mailbox doesn't exist\r\n")
                } else if cmd.starts_with("SELECT") {
                    format!(
                        "* 3 EXISTS\r\n* 1 RECENT\r\n* OK [UIDVALIDITY 7] ok\r\n\
                         {tag} OK [READ-WRITE] SELECT completed\r\n"
                    )
                } else if cmd == "UID FETCH 2 BODY[]" {
                    format!("* 2 FETCH (UID 2 BODY[] {{11}}\r\nhello world)\r\n{tag} OK FETCH completed\r\n")
                } else if cmd == "UID FETCH 3 BODY[]" {
                    // Attributes continue on the line after the literal.
                    format!(
                        "* 3 FETCH (BODY[] {{7}}\r\nHi\r\nyo! UID 3 FLAGS (\\Seen))\r\n\
                         {tag} OK FETCH completed\r\n"
                    )
                } else if cmd == "UID FETCH 9 BODY[]" {
                    format!("{tag} OK FETCH completed\r\n")
                } else if cmd.starts_with("UID SEARCH") {
                    format!("* SEARCH 1 2 3\r\n{tag} OK SEARCH completed\r\n")
                } else if cmd == "LOGOUT" {
                    format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n")
                } else {
                    format!("{tag} BAD unknown command\r\n")
                };
                io.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });
        port
    }

    fn settings(url: &str, custom: Option<&str>) -> RequestSettings {
        let mut s = RequestSettings::default();
        s.apply(OptionKey::Url, &OptionValue::from(url)).unwrap();
        s.apply(OptionKey::Username, &"user".into()).unwrap();
        s.apply(OptionKey::Password, &"secret".into()).unwrap();
        if let Some(cmd) = custom {
            s.apply(OptionKey::CustomRequest, &cmd.into()).unwrap();
        }
        s
    }

    async fn collect(stream: ChunkStream<'static>) -> Result<Vec<u8>, TransportFault> {
        let chunks: Vec<_> = stream.collect().await;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_fetch_delivers_body_only() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX;UID=2"), None);
        let body = collect(perform(&s)).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_fetch_with_attributes_after_literal() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX;UID=3"), None);
        let body = collect(perform(&s)).await.unwrap();
        assert_eq!(body, b"Hi\r\nyo!");
    }

    #[tokio::test]
    async fn test_fetch_unknown_uid_is_not_found() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX;UID=9"), None);
        let err = collect(perform(&s)).await.unwrap_err();
        assert_eq!(err.code, TransferCode::RemoteFileNotFound);
    }

    #[tokio::test]
    async fn test_mailbox_url_reports_select_status() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX"), None);
        let body = String::from_utf8(collect(perform(&s)).await.unwrap()).unwrap();
        assert!(body.starts_with("* 3 EXISTS\r\n* 1 RECENT\r\n"), "{body}");
        assert!(body.contains("[UIDVALIDITY 7]"));
    }

    #[tokio::test]
    async fn test_missing_mailbox() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/Missing"), None);
        let err = collect(perform(&s)).await.unwrap_err();
        assert_eq!(err.code, TransferCode::RemoteFileNotFound);
    }

    #[tokio::test]
    async fn test_custom_request_delivers_untagged() {
        let port = fake_server(true).await;
        let s = settings(
            &format!("imap://127.0.0.1:{port}/INBOX"),
            Some("UID SEARCH SINCE 01-Jan-2026"),
        );
        let body = collect(perform(&s)).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("* SEARCH 1 2 3"));
    }

    #[tokio::test]
    async fn test_login_denied() {
        let port = fake_server(false).await;
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX;UID=2"), None);
        let err = collect(perform(&s)).await.unwrap_err();
        assert_eq!(err.code, TransferCode::LoginDenied);
    }

    #[tokio::test]
    async fn test_rejected_command_is_quote_error() {
        let port = fake_server(true).await;
        let s = settings(&format!("imap://127.0.0.1:{port}"), Some("FROBNICATE"));
        let err = collect(perform(&s)).await.unwrap_err();
        assert_eq!(err.code, TransferCode::QuoteError);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let s = settings(&format!("imap://127.0.0.1:{port}/INBOX"), None);
        let err = collect(perform(&s)).await.unwrap_err();
        assert_eq!(err.code, TransferCode::CouldntConnect);
    }
}
