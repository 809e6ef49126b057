// Accept loop over TCP or a unix socket: spawns a session per connection and drives the timing loops

use crate::config::ServerConfig;
use crate::scheduler::Sched;
use crate::session::Session;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, error, info, instrument, warn};

/// Listen or connect address: `unix:///path`, `tcp://host:port` or a bare `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(addr: &str) -> Result<Self, String> {
        let endpoint = if let Some(path) = addr.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(format!("unix address {:?} has no socket path", addr));
            }
            Endpoint::Unix(PathBuf::from(path))
        } else {
            let host = addr.strip_prefix("tcp://").unwrap_or(addr);
            if host.is_empty() {
                return Err("tcp address is empty".to_string());
            }
            if host.contains("://") {
                return Err(format!("unsupported address scheme in {:?}", addr));
            }
            Endpoint::Tcp(host.to_string())
        };
        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound listening socket
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind `endpoint`; a socket file left behind by an earlier run is replaced
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    /// Address clients can reach this listener on
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    fn remove_socket_file(&self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path)
        }
        // Anything else at the path is left alone and bind reports it
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Serves clients and workers on a bound listener
pub struct Server {
    listener: Listener,
    sched: Arc<Sched>,
    idle_timeout: Option<Duration>,
}

impl Server {
    pub fn new(listener: impl Into<Listener>, sched: Arc<Sched>, config: &ServerConfig) -> Self {
        let idle_timeout =
            (config.idle_timeout_seconds > 0).then(|| Duration::from_secs(config.idle_timeout_seconds));
        Self {
            listener: listener.into(),
            sched,
            idle_timeout,
        }
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Accept connections until the scheduler shuts down
    ///
    /// Returns once the accept loop and both timing loops have stopped.
    /// Only then may the job store be closed.
    #[instrument(skip_all, fields(addr = ?self.local_endpoint().ok()))]
    pub async fn run(self) {
        let mut shutdown_rx = self.sched.shutdown_receiver();

        let timer = tokio::spawn(self.sched.clone().run_delay_timer());
        let supervisor = tokio::spawn(self.sched.clone().run_timeout_supervisor());

        info!("Server accepting connections");

        while !self.sched.is_closed() {
            tokio::select! {
                accepted = self.accept() => {
                    if let Err(e) = accepted {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        if let Err(e) = timer.await {
            error!(error = %e, "Delay timer task failed");
        }
        if let Err(e) = supervisor.await {
            error!(error = %e, "Timeout supervisor task failed");
        }

        self.listener.remove_socket_file();
        info!("Server stopped");
    }

    /// Take one connection and hand it to a new session task
    async fn accept(&self) -> io::Result<()> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let (reader, writer) = stream.into_split();
                self.spawn_session(peer.to_string(), reader, writer);
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                self.spawn_session(format!("unix:{}", path.display()), reader, writer);
            }
        }
        Ok(())
    }

    fn spawn_session<R, W>(&self, peer: String, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(self.sched.clone(), peer, self.idle_timeout);
        tokio::spawn(session.run(reader, writer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::SchedulerConfig;
    use crate::models::NewJob;
    use crate::protocol::Role;
    use crate::storage::MemoryStore;

    async fn sched() -> Arc<Sched> {
        Sched::new(
            Arc::new(MemoryStore::new()),
            SchedulerConfig {
                default_timeout_seconds: 300,
            },
        )
        .await
        .unwrap()
    }

    fn config(listen: &str) -> ServerConfig {
        ServerConfig {
            listen: listen.to_string(),
            idle_timeout_seconds: 0,
        }
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("unix:///tmp/periodic.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/periodic.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5000").unwrap(),
            Endpoint::Tcp("127.0.0.1:5000".to_string())
        );
        assert_eq!(
            Endpoint::parse("127.0.0.1:5000").unwrap(),
            Endpoint::Tcp("127.0.0.1:5000".to_string())
        );
        assert!(Endpoint::parse("unix://").is_err());
        assert!(Endpoint::parse("http://example.com").is_err());
        assert!(Endpoint::parse("").is_err());

        let endpoint = Endpoint::parse("unix:///tmp/periodic.sock").unwrap();
        assert_eq!(endpoint.to_string(), "unix:///tmp/periodic.sock");
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let sched = sched().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, sched.clone(), &config("127.0.0.1:0"));
        assert!(matches!(server.local_endpoint().unwrap(), Endpoint::Tcp(_)));

        let handle = tokio::spawn(server.run());
        tokio::task::yield_now().await;
        sched.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        sched.close_store().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_serves_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periodic.sock");
        let endpoint = Endpoint::Unix(path.clone());

        // A leftover socket from a previous run does not block the bind
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let sched = sched().await;
        let listener = Listener::bind(&endpoint).await.unwrap();
        let server = Server::new(listener, sched.clone(), &config(&endpoint.to_string()));
        assert_eq!(server.local_endpoint().unwrap(), endpoint);
        let handle = tokio::spawn(server.run());

        let mut client = Client::connect(&endpoint, Role::Client).await.unwrap();
        client.submit(NewJob::new("email", "a")).await.unwrap();
        let mut worker = Client::connect(&endpoint, Role::Worker).await.unwrap();
        worker.subscribe(["email"]).await.unwrap();
        assert_eq!(worker.grab().await.unwrap().name, "a");

        sched.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        assert!(Listener::bind(&Endpoint::Unix(path.clone())).await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }
}
