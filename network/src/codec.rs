//! Newline-delimited JSON framing: one message per line.

use consensus::Message;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{NetworkError, Result};

pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decodes one line, with or without its trailing newline.
pub fn decode_frame(line: &str) -> Result<Message> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(NetworkError::Protocol("empty frame".to_string()));
    }
    Ok(serde_json::from_str(line)?)
}

/// Decodes one raw line as read off the socket.
pub fn decode_frame_bytes(line: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(line)
        .map_err(|e| NetworkError::Protocol(format!("frame is not UTF-8: {}", e)))?;
    decode_frame(text)
}

/// Splits a byte stream into raw lines. Bytes are not checked for UTF-8
/// here, so one bad frame does not end the stream.
pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Next line including its newline, or `None` at end of stream.
    pub(crate) async fn next_frame(&mut self) -> std::io::Result<Option<&[u8]>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(&self.line))
    }
}

pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
