use crate::error::Result;
use crate::security::RateLimitError;
use crate::smtp::session::{SessionServices, SmtpReply, SmtpSession};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// SMTP listener spawning one session per connection
pub struct SmtpServer {
    services: Arc<SessionServices>,
}

impl SmtpServer {
    pub fn new(services: Arc<SessionServices>) -> Self {
        Self { services }
    }

    /// Admit a connection from `remote_ip` through the connection limiter
    pub async fn new_session(&self, remote_ip: IpAddr) -> std::result::Result<SmtpSession, RateLimitError> {
        admit(&self.services, remote_ip).await
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.services.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!("SMTP server listening on {}", addr);
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        self.run_until_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until `shutdown` resolves
    ///
    /// Sessions in flight keep running after shutdown; only accepting stops.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting SMTP connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New SMTP connection from {}", addr);
                        let services = self.services.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(services, socket, addr).await {
                                error!("Session error for {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }
}

async fn admit(services: &Arc<SessionServices>, remote_ip: IpAddr) -> std::result::Result<SmtpSession, RateLimitError> {
    services.rate_limiter.check_connection(remote_ip).await?;
    Ok(SmtpSession::new(services.clone(), remote_ip))
}

async fn handle_connection(services: Arc<SessionServices>, mut socket: TcpStream, addr: SocketAddr) -> Result<()> {
    let session = match admit(&services, addr.ip()).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Refusing connection from {}: {}", addr, e);
            let reply = SmtpReply::new(421, format!("{} Too many connections, try again later", services.hostname));
            socket.write_all(reply.to_wire().as_bytes()).await?;
            socket.shutdown().await?;
            return Ok(());
        }
    };

    session.run(socket).await?;
    debug!("Connection from {} closed", addr);
    Ok(())
}
