// Wire protocol: newline-delimited JSON frames exchanged with clients and workers

use crate::errors::{ErrorCode, ProtocolError, SchedError};
use crate::models::{FuncStat, Job, JobAssignment, NewJob};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames longer than this, newline excluded, are rejected
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Session role announced by the first frame of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Worker,
}

/// A request frame, tagged by `cmd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Hello {
        role: Role,
    },
    Ping,

    // Client commands
    Submit(NewJob),
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        func: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Info {
        func: String,
        name: String,
    },
    Drop {
        func: String,
    },
    Remove {
        func: String,
        name: String,
    },

    // Worker commands
    Subscribe {
        funcs: Vec<String>,
    },
    Unsubscribe {
        func: String,
    },
    Grab,
    Complete {
        func: String,
        name: String,
    },
    Fail {
        func: String,
        name: String,
    },
    SchedLater {
        func: String,
        name: String,
        #[serde(default)]
        delay: u64,
    },
}

impl Request {
    /// Command name, for logging
    pub fn command(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Ping => "ping",
            Request::Submit(_) => "submit",
            Request::Status { .. } => "status",
            Request::Info { .. } => "info",
            Request::Drop { .. } => "drop",
            Request::Remove { .. } => "remove",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Grab => "grab",
            Request::Complete { .. } => "complete",
            Request::Fail { .. } => "fail",
            Request::SchedLater { .. } => "sched_later",
        }
    }
}

/// A reply frame, tagged by `reply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Pong,
    Job { job: JobAssignment },
    Status { functions: Vec<FuncStat> },
    Info { job: Job },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<SchedError> for Response {
    fn from(err: SchedError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// Parse one frame
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Read the next raw frame; `None` once the peer has closed the connection
///
/// Never buffers more than `MAX_FRAME_LEN` bytes. An oversized or non UTF-8
/// frame is consumed up to its newline and reported as `Malformed`, leaving
/// the stream positioned at the next frame.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = AsyncReadExt::take(&mut *reader, MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if buf.len() > MAX_FRAME_LEN {
            skip_line(reader).await?;
            return Err(ProtocolError::Malformed(format!(
                "frame exceeds {} bytes",
                MAX_FRAME_LEN
            )));
        }

        // Blank lines are keep-alives
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return String::from_utf8(std::mem::take(&mut buf))
            .map(Some)
            .map_err(|_| ProtocolError::Malformed("frame is not valid UTF-8".to_string()));
    }
}

/// Discard input up to and including the next newline
async fn skip_line<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Read and parse the next frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => decode(&line).map(Some),
        None => Ok(None),
    }
}

/// Serialize and send one frame
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
