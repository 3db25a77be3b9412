use crate::protocol::GenericResponse;
use crate::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::*;

/// Longest request line accepted when no other limit is configured
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// One line of input, as read off the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestLine {
    /// The line without its terminator.  Raw bytes, because nothing guarantees the client sent
    /// valid UTF-8, and that's a protocol error to report rather than a transport failure.
    Complete(Vec<u8>),

    /// The line was longer than `limit` bytes.  It has been consumed and discarded.
    TooLong { limit: usize },
}

/// Trait representing a transport over which tool call requests and responses can be sent
#[async_trait::async_trait]
pub trait McpTransport: Send {
    /// Read the next request line from the transport.
    /// Returns None if the transport has been closed
    async fn read_request(&mut self) -> Result<Option<RequestLine>>;

    /// Write a response to the transport
    async fn write_response(&mut self, response: GenericResponse) -> Result<()> {
        self.write_response_string(&serde_json::to_string(&response)?)
            .await
    }

    /// Write a response to the transport as a single line, flushing it immediately
    async fn write_response_string(&mut self, response: &str) -> Result<()>;
}

/// Implementation of McpTransport for any AsyncRead/AsyncWrite pair
pub struct StreamTransport<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
    max_line_bytes: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Lines longer than this, not counting the terminator, are reported as
    /// [`RequestLine::TooLong`] instead of being buffered.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
}

#[async_trait::async_trait]
impl<R, W> McpTransport for StreamTransport<R, W>
where
    R: AsyncBufReadExt + Unpin + Send,
    W: AsyncWriteExt + Unpin + Send,
{
    async fn read_request(&mut self) -> Result<Option<RequestLine>> {
        // Room for the line plus a CRLF terminator.  Anything past that is skipped, not stored.
        let keep = self.max_line_bytes.saturating_add(2);
        let mut line = Vec::new();
        let mut bytes_read = 0;
        let mut overflowed = false;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let (used, found_newline) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };

            if !overflowed {
                line.extend_from_slice(&available[..used]);
                if line.len() > keep {
                    overflowed = true;
                    line = Vec::new();
                }
            }
            self.reader.consume(used);
            bytes_read += used;

            if found_newline {
                break;
            }
        }

        if bytes_read == 0 {
            return Ok(None);
        }

        if !overflowed {
            if line.last() == Some(&b'\n') {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
            }
            if line.len() <= self.max_line_bytes {
                return Ok(Some(RequestLine::Complete(line)));
            }
        }

        debug!(bytes_read, limit = self.max_line_bytes, "Discarded over-long request line");
        Ok(Some(RequestLine::TooLong {
            limit: self.max_line_bytes,
        }))
    }

    async fn write_response_string(&mut self, response: &str) -> Result<()> {
        self.writer.write_all(response.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// Type alias for the common stdio case
pub type StdioTransport = StreamTransport<
    tokio::io::BufReader<tokio::io::Stdin>,
    tokio::io::BufWriter<tokio::io::Stdout>,
>;

impl StdioTransport {
    pub fn stdio(stdin: tokio::io::Stdin, stdout: tokio::io::Stdout) -> Self {
        Self::new(
            tokio::io::BufReader::new(stdin),
            tokio::io::BufWriter::new(stdout),
        )
    }
}
