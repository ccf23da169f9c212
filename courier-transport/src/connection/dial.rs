//! Dialing: address parsing, DNS resolution, and the connect loop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::retry::{RetryPolicy, with_retries};

/// Split a `host:port` remote address.
///
/// The host may be a DNS name, an IPv4 literal, or a bracketed IPv6
/// literal; the port must be a decimal in `1..=65535`.
///
/// # Errors
///
/// [`TransportError::Format`] for anything that does not match.
pub(crate) fn parse_remote_address(address: &str) -> TransportResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Format(address.to_string()))?;
    let host = match (host.strip_prefix('['), host.ends_with(']')) {
        (Some(inner), true) => &inner[..inner.len() - 1],
        _ => host,
    };
    if host.is_empty() {
        return Err(TransportError::Format(address.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::Format(address.to_string()))?;
    if port == 0 {
        return Err(TransportError::Format(address.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Resolve and connect.
///
/// DNS goes through the retry helper to absorb transient resolver
/// failures; the resolved addresses are then tried in order and the first
/// successful connect wins. Cancellation is honored before DNS, between
/// address attempts, and while a connect is in flight.
pub(crate) async fn connect(
    remote_address: &str,
    connect_timeout: Duration,
    dns_retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> TransportResult<TcpStream> {
    let (host, port) = parse_remote_address(remote_address)?;

    if cancel.is_cancelled() {
        return Err(TransportError::Disconnected);
    }
    let addresses: Vec<SocketAddr> = with_retries("dns lookup", dns_retry, cancel, || async {
        let resolved = tokio::net::lookup_host((host.as_str(), port)).await?;
        Ok(resolved.collect())
    })
    .await?;

    if addresses.is_empty() {
        return Err(TransportError::CouldNotConnect {
            address: remote_address.to_string(),
            detail: "no addresses resolved".to_string(),
        });
    }

    let mut last_error: Option<std::io::Error> = None;
    for address in addresses {
        if cancel.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Disconnected),
            attempt = tokio::time::timeout(connect_timeout, TcpStream::connect(address)) => attempt,
        };
        match attempt {
            Ok(Ok(stream)) => {
                tracing::debug!(%address, "connected");
                return Ok(stream);
            }
            Ok(Err(error)) => {
                tracing::debug!(%address, %error, "connect attempt failed");
                last_error = Some(error);
            }
            Err(_) => {
                tracing::debug!(%address, ?connect_timeout, "connect attempt timed out");
                last_error = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ));
            }
        }
    }

    let detail = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "all connect attempts failed".to_string());
    tracing::warn!(remote = remote_address, %detail, "could not connect");
    Err(TransportError::CouldNotConnect {
        address: remote_address.to_string(),
        detail,
    })
}
