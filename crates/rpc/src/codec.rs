//! `Content-Length` framing.
//!
//! Each message is a header block terminated by an empty line, followed by exactly
//! `Content-Length` bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized","params":{}}
//! ```

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;
use crate::{Error, Result};

const CONTENT_LENGTH: &str = "content-length";

/// Largest body accepted from a peer.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Writes one framed message and flushes the stream.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let body = serde_json::to_string(&message.to_value())?;
	let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
	writer.write_all(frame.as_bytes()).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one framed message.
///
/// Returns `Ok(None)` on a clean EOF before any header byte. A body that is not valid JSON
/// yields [`Error::Deserialize`] after the body has been consumed, so the stream stays in sync
/// and the caller may keep reading. A header block that cannot be trusted, including a missing
/// or oversized `Content-Length`, yields [`Error::Framing`] and ends the stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<JsonValue>>
where
	R: AsyncBufRead + Unpin,
{
	let mut line = String::new();
	let mut content_length: Option<usize> = None;
	let mut saw_header = false;

	loop {
		line.clear();
		let bytes_read = reader.read_line(&mut line).await?;
		if bytes_read == 0 {
			if saw_header {
				return Err(Error::Io("unexpected EOF inside message header".into()));
			}
			return Ok(None);
		}

		let header = line.trim();
		if header.is_empty() {
			if saw_header {
				break;
			}
			// Stray blank line between messages.
			continue;
		}
		saw_header = true;

		let Some((name, value)) = header.split_once(':') else {
			return Err(Error::Framing(format!("malformed header line: {header:?}")));
		};
		if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
			content_length = Some(
				value
					.trim()
					.parse()
					.map_err(|_| Error::Framing(format!("invalid Content-Length: {:?}", value.trim())))?,
			);
		}
	}

	let length = content_length.ok_or_else(|| Error::Framing("missing Content-Length".into()))?;
	if length > MAX_CONTENT_LENGTH {
		return Err(Error::Framing(format!("Content-Length {length} exceeds {MAX_CONTENT_LENGTH}")));
	}

	let mut body = vec![0u8; length];
	reader.read_exact(&mut body).await?;

	let json: JsonValue = serde_json::from_slice(&body)?;
	Ok(Some(json))
}
