// Connection sessions: one task per peer, translating frames into scheduler calls

use crate::errors::{ErrorCode, ProtocolError, SchedError};
use crate::models::{JobAssignment, WorkerId};
use crate::protocol::{self, Request, Response, Role};
use crate::scheduler::Sched;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Role a session settled on after its HELLO
#[derive(Debug, Clone, Copy)]
enum SessionRole {
    Client,
    Worker(WorkerId),
}

/// One connected peer
pub struct Session {
    sched: Arc<Sched>,
    peer: String,
    idle_timeout: Option<Duration>,
    role: Option<SessionRole>,
}

impl Session {
    pub fn new(sched: Arc<Sched>, peer: impl Into<String>, idle_timeout: Option<Duration>) -> Self {
        Self {
            sched,
            peer: peer.into(),
            idle_timeout,
            role: None,
        }
    }

    /// Serve the connection until the peer leaves or the scheduler shuts down
    ///
    /// Frames are read by a separate task so a blocked GRAB still notices
    /// the peer going away. A worker session releases its waiting slot and
    /// its held job when it ends.
    #[instrument(skip_all, fields(peer = %self.peer))]
    pub async fn run<R, W>(mut self, reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (frame_tx, mut frames) = mpsc::channel(32);
        let (closed_tx, mut closed_rx) = watch::channel(false);
        let reader_task = tokio::spawn(read_frames(BufReader::new(reader), frame_tx, closed_tx));
        let mut shutdown_rx = self.sched.shutdown_receiver();

        debug!("Session opened");

        loop {
            let next = tokio::select! {
                next = self.next_frame(&mut frames) => next,
                _ = shutdown_rx.recv() => {
                    debug!("Scheduler shutting down, closing session");
                    break;
                }
            };

            let reply = match next {
                Ok(Some(line)) => match protocol::decode::<Request>(&line) {
                    Ok(request) => {
                        debug!(cmd = request.command(), "Request received");
                        self.handle(request, &mut closed_rx).await
                    }
                    Err(e) => Response::error(ErrorCode::ProtocolViolation, e.to_string()),
                },
                Ok(None) => break,
                Err(e @ ProtocolError::Malformed(_)) => {
                    debug!(error = %e, "Rejected unreadable frame");
                    Response::error(ErrorCode::ProtocolViolation, e.to_string())
                }
                Err(e) => {
                    warn!(error = %e, "Session read failed");
                    break;
                }
            };

            if let Err(e) = protocol::write_frame(&mut writer, &reply).await {
                debug!(error = %e, "Failed to write reply");
                break;
            }
        }

        if let Some(SessionRole::Worker(worker)) = self.role {
            self.sched.disconnect(worker).await;
        }
        reader_task.abort();

        debug!("Session closed");
    }

    /// Next raw frame, honouring the idle timeout for non-worker sessions
    async fn next_frame(
        &self,
        frames: &mut mpsc::Receiver<Result<String, ProtocolError>>,
    ) -> Result<Option<String>, ProtocolError> {
        let timeout = match self.role {
            Some(SessionRole::Worker(_)) => None,
            _ => self.idle_timeout,
        };

        let frame = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, frames.recv()).await {
                Ok(frame) => frame,
                Err(_) => {
                    info!(idle_seconds = timeout.as_secs(), "Closing idle session");
                    return Ok(None);
                }
            },
            None => frames.recv().await,
        };

        frame.transpose()
    }

    async fn handle(&mut self, request: Request, closed: &mut watch::Receiver<bool>) -> Response {
        let result = match (self.role, request) {
            (_, Request::Ping) => Ok(Response::Pong),
            (None, Request::Hello { role }) => self.hello(role).await,
            (Some(_), Request::Hello { .. }) => Err(SchedError::ProtocolViolation(
                "session role already chosen".to_string(),
            )),
            (None, request) => Err(SchedError::ProtocolViolation(format!(
                "expected hello before {}",
                request.command()
            ))),
            (Some(SessionRole::Client), request) => self.handle_client(request).await,
            (Some(SessionRole::Worker(worker)), request) => {
                self.handle_worker(worker, request, closed).await
            }
        };

        result.unwrap_or_else(|e| {
            if matches!(e, SchedError::PersistenceFailed(_)) {
                warn!(error = %e, "Operation rejected by job store");
            }
            Response::from(e)
        })
    }

    async fn hello(&mut self, role: Role) -> Result<Response, SchedError> {
        self.role = Some(match role {
            Role::Client => SessionRole::Client,
            Role::Worker => {
                let worker = Uuid::new_v4();
                self.sched.register_worker(worker).await?;
                info!(worker = %worker, "Worker connected");
                SessionRole::Worker(worker)
            }
        });
        Ok(Response::Ok)
    }

    async fn handle_client(&self, request: Request) -> Result<Response, SchedError> {
        match request {
            Request::Submit(new_job) => {
                self.sched.submit(new_job).await?;
                Ok(Response::Ok)
            }
            Request::Status { func, name } => {
                let functions = self
                    .sched
                    .status(func.as_deref(), name.as_deref())
                    .await?;
                Ok(Response::Status { functions })
            }
            Request::Info { func, name } => {
                let job = self.sched.info(&func, &name).await?;
                Ok(Response::Info { job })
            }
            Request::Drop { func } => {
                self.sched.drop_function(&func).await?;
                Ok(Response::Ok)
            }
            Request::Remove { func, name } => {
                self.sched.remove_job(&func, &name).await?;
                Ok(Response::Ok)
            }
            other => Err(SchedError::ProtocolViolation(format!(
                "{} is a worker command",
                other.command()
            ))),
        }
    }

    async fn handle_worker(
        &self,
        worker: WorkerId,
        request: Request,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<Response, SchedError> {
        match request {
            Request::Subscribe { funcs } => {
                self.sched.subscribe(worker, funcs).await?;
                Ok(Response::Ok)
            }
            Request::Unsubscribe { func } => {
                self.sched.unsubscribe(worker, &func).await?;
                Ok(Response::Ok)
            }
            Request::Grab => {
                let job = tokio::select! {
                    job = self.sched.grab(worker) => job?,
                    _ = closed.wait_for(|closed| *closed) => {
                        return Err(SchedError::ProtocolViolation("connection closed".to_string()));
                    }
                };
                Ok(Response::Job {
                    job: JobAssignment::from(&job),
                })
            }
            Request::Complete { func, name } => {
                self.report(self.sched.complete(worker, &func, &name).await)
            }
            Request::Fail { func, name } => self.report(self.sched.fail(worker, &func, &name).await),
            Request::SchedLater { func, name, delay } => {
                self.report(self.sched.sched_later(worker, &func, &name, delay).await)
            }
            other => Err(SchedError::ProtocolViolation(format!(
                "{} is a client command",
                other.command()
            ))),
        }
    }

    /// Outcome of a worker report; a stale report is logged, not fatal
    fn report(&self, result: Result<(), SchedError>) -> Result<Response, SchedError> {
        if let Err(SchedError::NotOwner { func, name }) = &result {
            warn!(func = %func, name = %name, "Ignoring report for a job this worker does not hold");
        }
        result.map(|()| Response::Ok)
    }
}

/// Reader half: forwards raw frames and flags the connection closed on EOF
///
/// A malformed frame is forwarded and reading goes on; any other error ends
/// the connection.
async fn read_frames<R>(
    mut reader: BufReader<R>,
    frames: mpsc::Sender<Result<String, ProtocolError>>,
    closed: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match protocol::read_line(&mut reader).await {
            Ok(Some(line)) => {
                if frames.send(Ok(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let fatal = !matches!(e, ProtocolError::Malformed(_));
                if frames.send(Err(e)).await.is_err() || fatal {
                    break;
                }
            }
        }
    }
    closed.send_replace(true);
}
