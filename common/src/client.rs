// Protocol client used by submitters, workers and tests

use crate::errors::ProtocolError;
use crate::models::{FuncStat, Job, JobAssignment, NewJob};
use crate::protocol::{self, Request, Response, Role};
use crate::server::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, instrument};

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A connection to the server in either role
pub struct Client {
    reader: BufReader<BoxReader>,
    writer: BoxWriter,
}

impl Client {
    /// Connect and announce the session role
    #[instrument(skip(endpoint), fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint, role: Role) -> Result<Self, ProtocolError> {
        let (reader, writer): (BoxReader, BoxWriter) = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let (reader, writer) = UnixStream::connect(path).await?.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        client.expect_ok(Request::Hello { role }).await?;
        debug!("Connected");
        Ok(client)
    }

    /// Send a request and wait for its reply; error replies become `Err`
    pub async fn call(&mut self, request: Request) -> Result<Response, ProtocolError> {
        protocol::write_frame(&mut self.writer, &request).await?;
        match protocol::read_frame(&mut self.reader).await? {
            Some(Response::Error { code, message }) => Err(ProtocolError::Server { code, message }),
            Some(reply) => Ok(reply),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn expect_ok(&mut self, request: Request) -> Result<(), ProtocolError> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    // ========== Client role ==========

    pub async fn submit(&mut self, job: NewJob) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Submit(job)).await
    }

    pub async fn status(
        &mut self,
        func: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<FuncStat>, ProtocolError> {
        let request = Request::Status {
            func: func.map(str::to_string),
            name: name.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Status { functions } => Ok(functions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn info(&mut self, func: &str, name: &str) -> Result<Job, ProtocolError> {
        let request = Request::Info {
            func: func.to_string(),
            name: name.to_string(),
        };
        match self.call(request).await? {
            Response::Info { job } => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn drop_function(&mut self, func: &str) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Drop {
            func: func.to_string(),
        })
        .await
    }

    pub async fn remove_job(&mut self, func: &str, name: &str) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Remove {
            func: func.to_string(),
            name: name.to_string(),
        })
        .await
    }

    // ========== Worker role ==========

    pub async fn subscribe<I, S>(&mut self, funcs: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expect_ok(Request::Subscribe {
            funcs: funcs.into_iter().map(Into::into).collect(),
        })
        .await
    }

    pub async fn unsubscribe(&mut self, func: &str) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Unsubscribe {
            func: func.to_string(),
        })
        .await
    }

    /// Block until the server hands over a job
    pub async fn grab(&mut self) -> Result<JobAssignment, ProtocolError> {
        match self.call(Request::Grab).await? {
            Response::Job { job } => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn complete(&mut self, func: &str, name: &str) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Complete {
            func: func.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn fail(&mut self, func: &str, name: &str) -> Result<(), ProtocolError> {
        self.expect_ok(Request::Fail {
            func: func.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn sched_later(
        &mut self,
        func: &str,
        name: &str,
        delay: u64,
    ) -> Result<(), ProtocolError> {
        self.expect_ok(Request::SchedLater {
            func: func.to_string(),
            name: name.to_string(),
            delay,
        })
        .await
    }
}

fn unexpected(reply: Response) -> ProtocolError {
    ProtocolError::UnexpectedReply(format!("{:?}", reply))
}
