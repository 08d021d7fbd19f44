//! Line framing.
//!
//! Every message is a single JSON document followed by `\n`. A clean end of
//! stream before a message starts means the peer went away. Lines are read as
//! bytes and capped at [`MAX_MESSAGE_SIZE`], so invalid UTF-8 and runaway
//! lines surface as malformed messages instead of I/O failures.

use std::io::{self, BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum size of one message line (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message exceeds maximum size of {limit} bytes")]
    TooLarge { limit: usize },
}

impl FrameError {
    /// Whether the error means the peer closed or reset the connection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            FrameError::Json(_) | FrameError::TooLarge { .. } => false,
        }
    }

    /// Whether the peer sent something that is not a message.
    pub fn is_malformed(&self) -> bool {
        matches!(self, FrameError::Json(_) | FrameError::TooLarge { .. })
    }
}

/// Read one message. Returns `Ok(None)` on end of stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, FrameError> {
    read_message_with_limit(reader, MAX_MESSAGE_SIZE)
}

/// [`read_message`] with an explicit line size limit.
///
/// After [`FrameError::TooLarge`] the rest of the line is still unread; the
/// stream cannot be resynchronized.
pub fn read_message_with_limit<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<T>, FrameError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > limit && line.last() != Some(&b'\n') {
            return Err(FrameError::TooLarge { limit });
        }
        // Tolerate keep-alive blank lines
        if !line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    let message = serde_json::from_slice(&line)?;
    Ok(Some(message))
}

/// Write one message and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let json = serde_json::to_string(message)?;
    writeln!(writer, "{}", json)?;
    writer.flush()?;
    Ok(())
}
