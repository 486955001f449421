use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::time::timeout;

use crate::SmtpError;

/// Longest text line accepted inside a DATA body, terminator included.
const MAX_DATA_LINE: usize = 64 * 1024;

/// Result of reading a DATA body up to the terminating `.` line.
#[derive(Debug, PartialEq)]
pub enum DataOutcome {
    /// The unstuffed message, without the terminator.
    Complete(Vec<u8>),
    /// The body exceeded the size cap and was drained and discarded.
    TooLarge,
}

/// Line-oriented framing over a client stream with per-operation timeouts.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(socket: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        Connection {
            reader: BufReader::new(reader),
            writer,
            read_timeout,
            write_timeout,
        }
    }

    /// Reads one line including its terminator. Returns `None` once the client has
    /// closed the stream. A line longer than `limit` is consumed and discarded.
    pub async fn read_line(&mut self, limit: usize) -> Result<Option<Vec<u8>>, SmtpError> {
        let mut line = Vec::new();
        let n = self.read_until_newline(&mut line, limit).await?;
        if n == 0 {
            return Ok(None);
        }

        if line.last() != Some(&b'\n') && n >= limit {
            let mut discard = Vec::new();
            loop {
                discard.clear();
                let n = self.read_until_newline(&mut discard, limit).await?;
                if n == 0 || discard.last() == Some(&b'\n') {
                    break;
                }
            }
            return Err(SmtpError::LineTooLong);
        }

        Ok(Some(line))
    }

    async fn read_until_newline(
        &mut self,
        buf: &mut Vec<u8>,
        limit: usize,
    ) -> Result<usize, SmtpError> {
        let read_timeout = self.read_timeout;
        let mut limited = (&mut self.reader).take(limit as u64);
        match timeout(read_timeout, limited.read_until(b'\n', buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SmtpError::Timeout),
        }
    }

    /// Reads a DATA body until the lone `.` line, removing dot-stuffing.
    pub async fn read_data(&mut self, max_bytes: usize) -> Result<DataOutcome, SmtpError> {
        let mut body = Vec::new();
        let mut too_large = false;

        loop {
            let line = match self.read_line(MAX_DATA_LINE).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(SmtpError::IoError(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during DATA",
                    )))
                }
                Err(SmtpError::LineTooLong) => {
                    too_large = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            let content = match line.first() {
                Some(b'.') => &line[1..],
                _ => &line[..],
            };

            if too_large {
                continue;
            }
            if body.len() + content.len() > max_bytes {
                too_large = true;
                body = Vec::new();
            } else {
                body.extend_from_slice(content);
            }
        }

        if too_large {
            Ok(DataOutcome::TooLarge)
        } else {
            Ok(DataOutcome::Complete(body))
        }
    }

    /// Writes a reply, appending the final CRLF. Multi-line replies are passed pre-joined.
    pub async fn write_reply(&mut self, reply: &str) -> Result<(), SmtpError> {
        let mut out = Vec::with_capacity(reply.len() + 2);
        out.extend_from_slice(reply.as_bytes());
        out.extend_from_slice(b"\r\n");

        let write_timeout = self.write_timeout;
        let write = async {
            self.writer.write_all(&out).await?;
            self.writer.flush().await
        };
        match timeout(write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SmtpError::Timeout),
        }
    }
}
