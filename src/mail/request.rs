//! IMAP request builders and response parsers.

use super::{Flag, MailServer};
use crate::transport::imap::quote;
use crate::xfer::types::TransferRequest;

fn authed(server: &MailServer, url: String, label: &str) -> TransferRequest {
    TransferRequest::new(url)
        .label(label)
        .credentials(&server.username, &server.password)
}

/// Read-only look at a mailbox; the response carries its `EXISTS` count.
pub fn examine(server: &MailServer, mailbox: &str) -> TransferRequest {
    authed(server, server.server_url(), "examine")
        .custom_request(format!("EXAMINE {}", quote(mailbox)))
}

/// UIDs of unread messages since the server's cutoff date.
pub fn search_unseen(server: &MailServer, mailbox: &str) -> TransferRequest {
    search(server, mailbox, Some(Flag::Seen), true)
}

/// UIDs of messages since the cutoff date, optionally restricted to those
/// with (or, with `invert`, without) `flag`.
pub fn search(
    server: &MailServer,
    mailbox: &str,
    flag: Option<Flag>,
    invert: bool,
) -> TransferRequest {
    let mut query = format!("UID SEARCH {}", server.since_criterion());
    if let Some(flag) = flag {
        query.push(' ');
        query.push_str(if invert { flag.reversed() } else { flag.keyword() });
    }
    authed(server, server.mailbox_url(mailbox), "search").custom_request(query)
}

/// Set or clear `flag` on one message.
pub fn store_flag(
    server: &MailServer,
    mailbox: &str,
    uid: u32,
    flag: Flag,
    set: bool,
) -> TransferRequest {
    let sign = if set { '+' } else { '-' };
    authed(server, server.mailbox_url(mailbox), "store").custom_request(format!(
        "UID STORE {uid} {sign}FLAGS ({})",
        flag.system_name()
    ))
}

/// Full RFC 822 source of one message.
pub fn fetch_message(server: &MailServer, mailbox: &str, uid: u32) -> TransferRequest {
    authed(server, server.message_url(mailbox, uid), "fetch")
}

/// Message count from the single `* N EXISTS` line of a `SELECT`/`EXAMINE`
/// response. `None` if there is no such line or more than one.
pub fn parse_exists(response: &str) -> Option<u32> {
    let mut counts = response.lines().filter_map(|line| {
        let rest = line.trim_end().strip_prefix("* ")?;
        let (n, word) = rest.split_once(' ')?;
        word.eq_ignore_ascii_case("EXISTS")
            .then(|| n.parse::<u32>().ok())
            .flatten()
    });
    let first = counts.next()?;
    counts.next().is_none().then_some(first)
}

/// Message numbers from every `* SEARCH` line, in response order.
pub fn parse_search(response: &str) -> Vec<u32> {
    response
        .lines()
        .filter_map(|line| {
            let rest = line.trim_end().strip_prefix("* ")?;
            let (word, ids) = rest.split_once(' ').unwrap_or((rest, ""));
            word.eq_ignore_ascii_case("SEARCH").then_some(ids)
        })
        .flat_map(str::split_ascii_whitespace)
        .filter_map(|id| id.parse().ok())
        .collect()
}
