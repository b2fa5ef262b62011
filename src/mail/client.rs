//! Mailbox client: runs request batches through a session manager and turns
//! the collected responses into typed answers.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::request;
use super::{collect_into_buffer, Flag, MailServer, ResponseBuffer};
use crate::transport::Transport;
use crate::xfer::error::{TransferCode, XferError};
use crate::xfer::manager::SessionManager;
use crate::xfer::options::{OptionKey, UserData};
use crate::xfer::types::{ManagerConfig, TransferRequest, TransferResult};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("could not find host: {0}")]
    CantFindHost(String),
    #[error("login denied")]
    LoginDenied,
    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),
    #[error("message {0} not found")]
    MessageNotFound(u32),
    #[error("query '{0}' seems invalid")]
    QueryError(String),
    #[error("failed to find * N EXISTS line")]
    ExistsParse,
    #[error("failed to request unread messages: {0}")]
    UnreadRequest(XferError),
    #[error("failed to store flag on message {uid}: {source}")]
    StoreFailed { uid: u32, source: XferError },
    #[error(transparent)]
    Transfer(#[from] XferError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxInfo {
    pub messages: u32,
    /// UIDs of unread messages since the cutoff date.
    pub unread: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchedMessage {
    pub uid: u32,
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub size: usize,
    pub digest: Option<String>,
    /// The `\Seen` flag was cleared again after the fetch.
    pub reset_read: bool,
}

struct Response {
    result: TransferResult,
    body: Vec<u8>,
}

impl Response {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct MailClient {
    server: MailServer,
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
}

impl MailClient {
    pub fn new(server: MailServer, transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        Self {
            server,
            transport,
            config,
        }
    }

    pub fn server(&self) -> &MailServer {
        &self.server
    }

    /// Message count and unread UIDs. Both requests run in the same batch.
    pub async fn mailbox_info(&self, mailbox: &str) -> Result<MailboxInfo, MailError> {
        let mut responses = self
            .run(vec![
                request::examine(&self.server, mailbox),
                request::search_unseen(&self.server, mailbox),
            ])
            .await?
            .into_iter();
        let (Some(examined), Some(unseen)) = (responses.next(), responses.next()) else {
            return Err(MailError::ExistsParse);
        };

        // EXAMINE runs without a selected mailbox, so a refusal means the name is unknown.
        self.check(&examined.result, "EXAMINE", mailbox)
            .map_err(|e| match e {
                MailError::QueryError(_) => MailError::MailboxNotFound(mailbox.to_string()),
                other => other,
            })?;
        let messages = request::parse_exists(&examined.text()).ok_or(MailError::ExistsParse)?;

        self.check(&unseen.result, "UID SEARCH UNSEEN", mailbox)
            .map_err(|e| match e {
                MailError::Transfer(e) => MailError::UnreadRequest(e),
                other => other,
            })?;
        let unread = request::parse_search(&unseen.text());

        info!(mailbox, messages, unread = unread.len(), "Mailbox examined");
        Ok(MailboxInfo { messages, unread })
    }

    /// UIDs since the cutoff date, optionally filtered on `flag`.
    pub async fn uids(
        &self,
        mailbox: &str,
        flag: Option<Flag>,
        invert: bool,
    ) -> Result<Vec<u32>, MailError> {
        let req = request::search(&self.server, mailbox, flag, invert);
        let query = custom_request(&req);
        let response = self.run_one(req).await?;
        self.check(&response.result, &query, mailbox)?;
        let uids = request::parse_search(&response.text());
        debug!(mailbox, found = uids.len(), "Search finished");
        Ok(uids)
    }

    /// Set (`state = true`) or clear `flag` on one message.
    pub async fn set_flag(
        &self,
        mailbox: &str,
        uid: u32,
        flag: Flag,
        state: bool,
    ) -> Result<(), MailError> {
        let req = request::store_flag(&self.server, mailbox, uid, flag, state);
        let query = custom_request(&req);
        let response = self.run_one(req).await?;
        self.check(&response.result, &query, mailbox)
            .map_err(|e| match e {
                MailError::Transfer(source) => MailError::StoreFailed { uid, source },
                other => other,
            })?;
        info!(mailbox, uid, flag = flag.keyword(), state, "Flag stored");
        Ok(())
    }

    /// Fetch one message. With `reset_read`, the `\Seen` flag the fetch set
    /// is cleared again afterwards.
    pub async fn fetch_message(
        &self,
        mailbox: &str,
        uid: u32,
        reset_read: bool,
    ) -> Result<FetchedMessage, MailError> {
        let response = self
            .run_one(request::fetch_message(&self.server, mailbox, uid))
            .await?;
        self.check(&response.result, "UID FETCH", mailbox)
            .map_err(|e| match e {
                MailError::MailboxNotFound(_) => MailError::MessageNotFound(uid),
                other => other,
            })?;
        if reset_read {
            self.set_flag(mailbox, uid, Flag::Seen, false).await?;
        }
        Ok(FetchedMessage {
            uid,
            size: response.body.len(),
            digest: response.result.digest,
            raw: response.body,
            reset_read,
        })
    }

    /// Fetch one message, leaving it unread if it was unread and the account
    /// asks for unread messages to stay untouched.
    pub async fn read_message(
        &self,
        mailbox: &str,
        uid: u32,
    ) -> Result<FetchedMessage, MailError> {
        let reset = self.server.dont_touch_unread
            && self.uids(mailbox, Some(Flag::Seen), true).await?.contains(&uid);
        self.fetch_message(mailbox, uid, reset).await
    }

    /// Flag a message that has been replied to, if the account wants that.
    /// Returns whether the flag was stored.
    pub async fn mark_replied(&self, mailbox: &str, uid: u32) -> Result<bool, MailError> {
        if !self.server.flag_replied {
            return Ok(false);
        }
        self.set_flag(mailbox, uid, Flag::Flagged, true).await?;
        Ok(true)
    }

    async fn run_one(&self, req: TransferRequest) -> Result<Response, MailError> {
        self.run(vec![req])
            .await?
            .pop()
            .ok_or(MailError::Transfer(XferError::Cancelled))
    }

    /// Run `requests` as one batch, each collecting into its own buffer.
    async fn run(&self, requests: Vec<TransferRequest>) -> Result<Vec<Response>, MailError> {
        let manager = SessionManager::new(Arc::clone(&self.transport), self.config.clone());
        let mut pending = Vec::with_capacity(requests.len());
        for req in requests {
            let buffer = Arc::new(ResponseBuffer::default());
            let data: UserData = buffer.clone();
            let ticket = manager
                .submit(req.on_chunk(Some(data), collect_into_buffer))
                .await?;
            pending.push((ticket, buffer));
        }
        manager.run_all().await;

        let mut responses = Vec::with_capacity(pending.len());
        for (ticket, buffer) in pending {
            let result = manager
                .result(&ticket.id)
                .await
                .ok_or(MailError::Transfer(XferError::Cancelled))?;
            responses.push(Response {
                result,
                body: buffer.take(),
            });
        }
        Ok(responses)
    }

    fn check(&self, result: &TransferResult, query: &str, mailbox: &str) -> Result<(), MailError> {
        let Some(err) = &result.error else {
            return if result.is_success() {
                Ok(())
            } else {
                Err(MailError::Transfer(XferError::Cancelled))
            };
        };
        Err(match err.transfer_code() {
            Some(TransferCode::CouldntResolveHost) => {
                MailError::CantFindHost(self.server.address.clone())
            }
            Some(TransferCode::LoginDenied) => MailError::LoginDenied,
            Some(TransferCode::QuoteError) => MailError::QueryError(query.to_string()),
            Some(TransferCode::RemoteFileNotFound) => {
                MailError::MailboxNotFound(mailbox.to_string())
            }
            _ => MailError::Transfer(err.clone()),
        })
    }
}

fn custom_request(req: &TransferRequest) -> String {
    req.options
        .iter()
        .rev()
        .find(|(k, _)| *k == OptionKey::CustomRequest)
        .and_then(|(_, v)| v.as_str())
        .unwrap_or_default()
        .to_string()
}
