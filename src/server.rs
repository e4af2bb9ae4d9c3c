//! HTTP server running a [Dispatcher]
//!
//! Besides serving the protocol endpoints, the server drives the session
//! sweeper. Both stop when the shutdown token is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::BayeuxConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::{ServerBuilderError, ServerError};
use crate::http;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";

pub struct Server {
    address: String,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

/// Builder pattern for [Server]
///
/// # Example
/// ```rust
/// # use bayeux_rs::server::ServerBuilder;
/// # use bayeux_rs::config::BayeuxConfig;
/// # async fn run_server() {
/// let mut server = ServerBuilder::new()
///     .address("127.0.0.1:8080".to_string())
///     .config(BayeuxConfig::default())
///     .build()
///     .unwrap();
/// let listener = server.bind().await.unwrap();
/// server.run(listener).await.unwrap();
/// # }
/// ```
pub struct ServerBuilder {
    address: String,
    config: Option<BayeuxConfig>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder {
            address: DEFAULT_ADDRESS.to_string(),
            config: None,
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, value: String) -> Self {
        self.address = value;
        self
    }

    pub fn config(mut self, value: BayeuxConfig) -> Self {
        self.config = Some(value);
        self
    }

    pub fn build(self) -> Result<Server, ServerBuilderError> {
        if self.address.is_empty() {
            return Err(ServerBuilderError::NoAddress);
        }
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(ServerBuilderError::InvalidConfig)?;
        Ok(Server::new(self.address, config))
    }
}

type ServerResult<T> = Result<T, ServerError>;

impl Server {
    pub fn new(address: String, config: BayeuxConfig) -> Server {
        Server {
            address,
            dispatcher: Arc::new(Dispatcher::new(config)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Token that stops [Server::run] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Setup the server for running it
    pub async fn bind(&mut self) -> ServerResult<TcpListener> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|err| ServerError::Bind(err.to_string()))?;
        Ok(listener)
    }

    pub fn try_local_addr(listener: &TcpListener) -> ServerResult<SocketAddr> {
        listener
            .local_addr()
            .map_err(|err| ServerError::Bind(err.to_string()))
    }

    /// Run the server until it is shut down
    ///
    /// Runs the HTTP endpoints and the session sweeper concurrently. On
    /// shutdown every session is disconnected so parked connects return
    /// before the HTTP server drains.
    pub async fn run(&mut self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = Self::try_local_addr(&listener)?;
        info!("Listening on `{}`", local_addr);

        let router = http::router(self.dispatcher.clone());
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let http_task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    dispatcher.disconnect_all();
                })
                .await
        });

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let sweeper_task = tokio::spawn(async move { dispatcher.run_sweeper(shutdown).await });

        let result = tokio::select! {
            http_result = http_task => {
                http_result
                    .map_err(|err| {
                        error!("http: JoinHandle error: {}", err);
                        ServerError::Run
                    })
                    .and_then(|served| served.map_err(|err| ServerError::Serve(err.to_string())))
            }
            sweeper_result = sweeper_task => {
                if !self.shutdown.is_cancelled() {
                    warn!("Session sweeper finished first");
                }
                sweeper_result.map_err(|err| {
                    error!("sweeper: JoinHandle error: {}", err);
                    ServerError::Run
                })
            }
        };
        self.shutdown.cancel();
        self.dispatcher.disconnect_all();
        info!("Server stopped");
        result
    }
}
