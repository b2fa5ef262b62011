//! HTTP(S) transfers through `reqwest`, body streamed chunk by chunk.

use std::error::Error as _;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::redirect::Policy;
use reqwest::{Method, Response};
use tracing::debug;

use super::{fail_stream, ChunkStream, RequestSettings};
use crate::xfer::error::{TransferCode, TransportFault};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

pub(crate) fn perform(settings: &RequestSettings) -> ChunkStream<'static> {
    let settings = settings.clone();
    stream::once(send(settings))
        .flat_map(|response| match response {
            Ok(resp) => resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| fault_from(&e)))
                .boxed(),
            Err(fault) => fail_stream(fault),
        })
        .boxed()
}

async fn send(settings: RequestSettings) -> Result<Response, TransportFault> {
    let Some(url) = settings.url else {
        return Err(TransportFault::new(TransferCode::UrlMalformed, "no URL set"));
    };

    let mut builder = reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        .redirect(if settings.follow_location {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        });
    if let Some(ua) = &settings.user_agent {
        builder = builder.user_agent(ua.as_str());
    }
    let client = builder
        .build()
        .map_err(|e| TransportFault::new(TransferCode::SslConnectError, e.to_string()))?;

    let method = match &settings.custom_request {
        Some(m) => Method::from_bytes(m.as_bytes()).map_err(|_| {
            TransportFault::new(TransferCode::UrlMalformed, format!("invalid HTTP method {m:?}"))
        })?,
        None => Method::GET,
    };

    if settings.verbose {
        debug!(method = %method, url = %url, "HTTP request");
    }

    let mut request = client.request(method, url);
    if let Some(user) = &settings.username {
        request = request.basic_auth(user, settings.password.as_deref());
    }
    if let Some(timeout) = settings.timeout {
        request = request.timeout(timeout);
    }

    let resp = request.send().await.map_err(|e| fault_from(&e))?;
    let status = resp.status();
    if settings.verbose {
        debug!(status = status.as_u16(), "HTTP response");
    }
    if settings.fail_on_error && (status.is_client_error() || status.is_server_error()) {
        let code = if status == reqwest::StatusCode::UNAUTHORIZED {
            TransferCode::LoginDenied
        } else {
            TransferCode::HttpReturnedError(status.as_u16())
        };
        return Err(TransportFault::new(code, format!("server returned {status}")));
    }
    Ok(resp)
}

fn fault_from(e: &reqwest::Error) -> TransportFault {
    let code = if e.is_timeout() {
        TransferCode::OperationTimedout
    } else if e.is_connect() {
        if chain_mentions(e, "dns error") {
            TransferCode::CouldntResolveHost
        } else {
            TransferCode::CouldntConnect
        }
    } else if e.is_builder() {
        TransferCode::UrlMalformed
    } else if e.is_request() {
        TransferCode::SendError
    } else {
        TransferCode::RecvError
    };
    TransportFault::new(code, e.to_string())
}

/// Whether any error in the source chain contains `needle`.
fn chain_mentions(e: &reqwest::Error, needle: &str) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if err.to_string().contains(needle) {
            return true;
        }
        source = err.source();
    }
    false
}
