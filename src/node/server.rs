//! Control server loop inside the worker process.
//!
//! Accepts connections on the node's published address and dispatches
//! framed control requests to the [`NodeController`]. Each connection is
//! served on its own task; responses are written in request order per
//! connection.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{PoolError, Result};
use crate::node::controller::NodeController;
use crate::protocol::{read_frame, write_frame, ControlRequest, ControlResponse, WireError};

pub struct NodeServer {
    controller: NodeController,
    listener: TcpListener,
}

impl NodeServer {
    pub async fn bind(controller: NodeController, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            controller,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve control connections until the node's shutdown token fires.
    pub async fn serve(self) -> Result<()> {
        let shutdown = self.controller.shutdown_token();
        tracing::info!(addr = %self.local_addr()?, "node control server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(controller, stream, peer).await {
                                tracing::debug!(error = %e, %peer, "control connection closed with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    controller: NodeController,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    tracing::debug!(%peer, "control connection opened");
    loop {
        let request: ControlRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(PoolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let is_shutdown = matches!(request, ControlRequest::Shutdown);
        let response = dispatch(&controller, request, peer).await;
        write_frame(&mut stream, &response).await?;
        if is_shutdown {
            // scheduled after the response is on the wire, so the caller
            // sees the call complete
            controller.shutdown();
        }
    }
}

async fn dispatch(
    controller: &NodeController,
    request: ControlRequest,
    peer: SocketAddr,
) -> ControlResponse {
    match request {
        ControlRequest::Platform => ControlResponse::Platform(controller.platform()),
        ControlRequest::Ping => match controller.ping() {
            Ok(()) => ControlResponse::Pong,
            Err(e) => fail(e),
        },
        ControlRequest::PoolHost => ControlResponse::PoolHost {
            host: controller.pool_host(Some(peer)),
        },
        ControlRequest::SetConsole { auth } => match controller.set_console(auth).await {
            Ok(enabled) => ControlResponse::Console { enabled },
            Err(e) => fail(e),
        },
        ControlRequest::BindClient { client_id } => {
            match controller.bind_client(&client_id).await {
                Ok(session) => ControlResponse::Session {
                    token: session.token(),
                },
                Err(e) => fail(e),
            }
        }
        ControlRequest::UnbindClient => match controller.unbind_client().await {
            Ok(()) => ControlResponse::Done,
            Err(e) => fail(e),
        },
        ControlRequest::RunSnippet { code } => match controller.run_snippet(&code).await {
            Ok(output) => ControlResponse::Eval { output },
            Err(e) => fail(e),
        },
        ControlRequest::RunMainLoop { session, command } => {
            match controller.run_for_session(session, command, false).await {
                Ok(output) => ControlResponse::Eval { output },
                Err(e) => fail(e),
            }
        }
        ControlRequest::RunAsync { session, command } => {
            match controller.run_for_session(session, command, true).await {
                Ok(output) => ControlResponse::Eval { output },
                Err(e) => fail(e),
            }
        }
        ControlRequest::Shutdown => ControlResponse::Done,
    }
}

fn fail(e: PoolError) -> ControlResponse {
    ControlResponse::Err(WireError::from(&e))
}
