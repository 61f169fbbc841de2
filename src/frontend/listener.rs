//! Frontend listener implementation.

use crate::proxy::ProxyEngine;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Frontend listener that accepts and serves client connections.
pub struct FrontendListener {
    /// TCP listener.
    listener: TcpListener,
    /// Engine every request is dispatched to.
    engine: Arc<ProxyEngine>,
}

impl FrontendListener {
    /// Bind a new frontend listener.
    pub async fn bind(address: SocketAddr, engine: Arc<ProxyEngine>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        info!(
            listen = %listener.local_addr()?,
            strategy = %engine.strategy(),
            backends = engine.registry().count(),
            "frontend listener bound"
        );

        Ok(Self { listener, engine })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one client connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let engine = Arc::clone(&engine);
                async move { Ok::<_, Infallible>(engine.handle(req, client_addr).await) }
            });

            // HTTP/1.1 with keep-alive
            if let Err(e) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                debug!(client = %client_addr, error = %e, "client connection closed with error");
            }
        });
    }
}
