//! Base-protocol framing: `Content-Length: N\r\n\r\n<json>`.
//!
//! [`MessageReader`] yields one JSON value per frame, [`MessageWriter`]
//! emits header and body as a single write so concurrent callers never
//! interleave partial frames (the session still funnels writes through one
//! task).

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next message, or `Ok(None)` on a clean EOF between frames.
    pub async fn next_message(&mut self) -> Result<Option<Value>> {
        let Some(length) = self.read_header_block().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; length];
        self.inner
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        serde_json::from_slice(&body)
            .map(Some)
            .context("frame body is not valid JSON")
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut first = true;
        loop {
            self.line.clear();
            let n = self
                .inner
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if first {
                    return Ok(None);
                }
                bail!("stream ended inside a frame header");
            }
            first = false;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            if let Some(value) = content_length(header) {
                length = Some(value?);
            }
        }
        length.map(Some).context("frame header has no Content-Length")
    }
}

/// `Some` when `header` is a Content-Length line (any case).
fn content_length(header: &str) -> Option<Result<usize>> {
    let (name, value) = header.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return None;
    }
    Some(
        value
            .trim()
            .parse()
            .with_context(|| format!("bad Content-Length value {:?}", value.trim())),
    )
}

pub struct MessageWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, message: &Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing message")?;
        self.buf.clear();
        self.buf
            .extend_from_slice(format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).as_bytes());
        self.buf.extend_from_slice(&body);

        self.inner
            .write_all(&self.buf)
            .await
            .context("writing frame")?;
        self.inner.flush().await.context("flushing frame")
    }

    /// Flush and close the underlying stream.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await.context("closing stream")
    }
}
