//! TCP listener: one task per connection, graceful stop on a shutdown future.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dwd_core::RelayConfig;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::error::{RelayError, RelayResult};
use crate::session::{MessageSink, Session};

pub struct RelayServer {
    listener: TcpListener,
    sink: Arc<dyn MessageSink>,
    config: RelayConfig,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig, sink: Arc<dyn MessageSink>) -> RelayResult<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::io(format!("cannot listen on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            sink,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is stopped.
    pub async fn serve(self) -> RelayResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then wait for open sessions to finish.
    pub async fn serve_until<F>(self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        match self.config.allowed_domain {
            Some(ref domain) => info!("SMTP relay listening on {} (senders @{} only)", addr, domain),
            None => info!("SMTP relay listening on {} (no sender domain restriction)", addr),
        }

        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down relay, finishing {} session(s)", sessions.len());
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    debug!("Connection from {}", peer);
                    let session = Session::new(stream, self.sink.clone(), &self.config);
                    sessions.spawn(async move {
                        if let Err(e) = session.run().await {
                            debug!("Session with {} ended: {}", peer, e);
                        }
                    });
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
