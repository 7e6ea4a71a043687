//! Content-Length framing for JSON-RPC messages.
//!
//! The CLI frames every message the vscode-jsonrpc way: ASCII header lines
//! terminated by CRLF (bare LF tolerated), a mandatory `Content-Length`
//! header, a blank line, then exactly that many bytes of UTF-8 JSON.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{CopilotError, Result};

/// Read one framed message body.
///
/// Returns `Ok(None)` on a clean end-of-stream before a complete header
/// block. A header block without a valid `Content-Length` fails with
/// [`CopilotError::Protocol`].
pub(crate) async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            // EOF. Mid-header-block this still counts as end-of-stream;
            // the peer hung up between messages.
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank line between messages; keep scanning.
            continue;
        }

        saw_header = true;
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(CopilotError::Protocol(format!(
                "malformed header line: {trimmed:?}"
            )));
        };

        if name.trim().eq_ignore_ascii_case("Content-Length") {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                CopilotError::Protocol(format!("invalid Content-Length: {:?}", value.trim()))
            })?;
            content_length = Some(parsed);
        }
        // Other headers (e.g. Content-Type) are tolerated and ignored.
    }

    let content_length = content_length
        .ok_or_else(|| CopilotError::Protocol("missing Content-Length header".into()))?;

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Frame and write one message as a single contiguous header+body flush.
pub(crate) async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(body.len() + 32);
    frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Serialize a message and frame it in one step.
pub(crate) fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}
