//! TCP transport
//!
//! Each RPC opens a connection, writes one length-delimited bincode frame
//! and reads one frame back.

use super::{RpcHandler, Transport};
use crate::rpc::{RaftRequest, RaftResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use replica_core::{Member, ReplicaError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Client side of the TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Request timeout
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn send_rpc(&self, target: &Member, request: &RaftRequest) -> Result<RaftResponse> {
        let payload = bincode::serialize(request)?;
        let stream = TcpStream::connect(&target.address).await.map_err(|e| {
            ReplicaError::Network(format!("Failed to connect to {}: {}", target, e))
        })?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, codec());

        framed
            .send(Bytes::from(payload))
            .await
            .map_err(|e| ReplicaError::Network(format!("Failed to write request: {}", e)))?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| ReplicaError::Network(format!("{} closed the connection", target)))?
            .map_err(|e| ReplicaError::Network(format!("Failed to read response: {}", e)))?;

        Ok(bincode::deserialize(&frame)?)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, target: &Member, request: RaftRequest) -> Result<RaftResponse> {
        tokio::time::timeout(self.timeout, self.send_rpc(target, &request))
            .await
            .map_err(|_| ReplicaError::Timeout(self.timeout))?
    }
}

/// Raft RPC server - handles incoming RPC requests from peers
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    /// Bind the listening socket
    pub async fn bind(address: &str, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, handler })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!("Raft RPC server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Raft RPC server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                warn!("Error handling connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Serve requests on one connection until the peer closes it
async fn handle_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, codec());

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| ReplicaError::Network(format!("Failed to read request: {}", e)))?;
        let response = match bincode::deserialize::<RaftRequest>(&frame) {
            Ok(request) => handler.handle(request).await,
            Err(e) => {
                debug!("Rejecting undecodable request: {}", e);
                RaftResponse::Error(format!("Failed to deserialize request: {}", e))
            }
        };
        let payload = bincode::serialize(&response)?;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(|e| ReplicaError::Network(format!("Failed to write response: {}", e)))?;
    }

    Ok(())
}
