//! Transport layer for Copilot CLI communication.
//!
//! Owns the bidirectional byte stream to the CLI: either the stdio pipes of
//! a managed child process, or a TCP socket. The transport itself is only a
//! pair of halves plus a cancellation token; the RPC layer owns the reader
//! and writer tasks.

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CopilotError, Result};

pub(crate) type TransportReader = BufReader<Pin<Box<dyn AsyncRead + Send>>>;
pub(crate) type TransportWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A connected byte stream to the CLI, split into read and write halves.
///
/// Closing is interruptible: cancelling the token unblocks a reader parked
/// on bytes, which exits its loop cleanly instead of failing mid-message.
pub(crate) struct Transport {
    pub(crate) reader: TransportReader,
    pub(crate) writer: TransportWriter,
    pub(crate) cancel: CancellationToken,
}

impl Transport {
    /// Wrap the stdio pipes of a managed child process.
    pub(crate) fn stdio(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self {
            reader: BufReader::new(Box::pin(stdout) as Pin<Box<dyn AsyncRead + Send>>),
            writer: Box::pin(stdin),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect to a CLI server over TCP.
    pub(crate) async fn tcp(address: &CliAddress) -> Result<Self> {
        debug!("Connecting to Copilot CLI at {}:{}", address.host, address.port);
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(Box::pin(read_half) as Pin<Box<dyn AsyncRead + Send>>),
            writer: Box::pin(write_half),
            cancel: CancellationToken::new(),
        })
    }

    /// In-memory transport for tests.
    #[cfg(test)]
    pub(crate) fn duplex(stream: tokio::io::DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::pin(read) as Pin<Box<dyn AsyncRead + Send>>),
            writer: Box::pin(write),
            cancel: CancellationToken::new(),
        }
    }
}

/// A parsed `cli_url` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliAddress {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// Parse the accepted `cli_url` forms: `PORT`, `HOST:PORT`, or
/// `scheme://HOST:PORT` (the scheme is ignored). The port must be in
/// 1..=65535.
pub(crate) fn parse_cli_url(url: &str) -> Result<CliAddress> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CopilotError::InvalidConfig("cli_url must not be empty".into()));
    }

    let without_scheme = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let without_scheme = without_scheme.trim_end_matches('/');

    let (host, port_str) = match without_scheme.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("127.0.0.1", without_scheme),
    };

    let port: u32 = port_str.parse().map_err(|_| {
        CopilotError::InvalidConfig(format!("cli_url has an invalid port: {url:?}"))
    })?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(CopilotError::InvalidConfig(format!(
            "cli_url port must be in 1..65535, got {port}"
        )));
    }

    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok(CliAddress {
        host: host.to_string(),
        port: port as u16,
    })
}
