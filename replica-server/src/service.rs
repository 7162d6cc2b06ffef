//! Line-delimited JSON client service
//!
//! Each request is one JSON object per line, tagged by `op`:
//!
//! ```text
//! {"op":"set","key":"a","value":"1"}
//! {"op":"delete","key":"a"}
//! {"op":"get","key":"a"}
//! {"op":"add_member","id":"node4","address":"10.0.0.4:7001"}
//! {"op":"remove_member","id":"node4"}
//! {"op":"status"}
//! ```
//!
//! Each request gets exactly one response line. Writes sent to a follower
//! fail with `retryable: true` and the known leader in `leader`, so clients
//! can redirect. Reads are served from the local state machine and may be
//! stale on followers.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use replica_core::{Member, MemberId, ReplicaError, Result, Roster};
use replica_raft::{KvCommand, KvOutput, KvQuery, RaftStatus, Service, SubmitHandle};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Set { key: String, value: String },
    Delete { key: String },
    Get { key: String },
    AddMember { id: String, address: String },
    RemoveMember { id: String },
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub ok: bool,
    /// Value read by `get`, or the value replaced by `set`/`delete`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Roster after a membership change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roster: Option<Vec<Member>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RaftStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where to send the request instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<Member>,
    #[serde(default)]
    pub retryable: bool,
}

impl ClientResponse {
    fn value(value: Option<Vec<u8>>) -> Self {
        Self {
            ok: true,
            value: value.map(|v| String::from_utf8_lossy(&v).into_owned()),
            ..Default::default()
        }
    }

    fn roster(roster: Roster) -> Self {
        Self {
            ok: true,
            roster: Some(roster.iter().cloned().collect()),
            ..Default::default()
        }
    }

    fn failed(err: &ReplicaError) -> Self {
        Self {
            ok: false,
            error: Some(err.to_string()),
            leader: err.leader_hint().cloned(),
            retryable: err.is_retryable(),
            ..Default::default()
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            ok: false,
            error: Some(message),
            ..Default::default()
        }
    }
}

async fn write(handle: &SubmitHandle, command: KvCommand) -> Result<ClientResponse> {
    let command = command.encode().map_err(ReplicaError::Serialization)?;
    let output = handle.submit(command).await?;
    match KvOutput::decode(&output).map_err(ReplicaError::StateMachine)? {
        KvOutput::Previous(previous) => Ok(ClientResponse::value(previous)),
        KvOutput::Swapped { current, .. } => Ok(ClientResponse::value(current)),
    }
}

/// Run one client request against the replica
pub async fn execute(handle: &SubmitHandle, request: ClientRequest) -> ClientResponse {
    debug!(?request, "Client request");
    let result = match request {
        ClientRequest::Set { key, value } => {
            write(
                handle,
                KvCommand::Set {
                    key,
                    value: value.into_bytes(),
                },
            )
            .await
        }
        ClientRequest::Delete { key } => write(handle, KvCommand::Delete { key }).await,
        ClientRequest::Get { key } => KvQuery::Get { key }
            .encode()
            .map_err(ReplicaError::Serialization)
            .and_then(|query| handle.query(&query))
            .and_then(|bytes| KvQuery::decode_value(&bytes).map_err(ReplicaError::StateMachine))
            .map(ClientResponse::value),
        ClientRequest::AddMember { id, address } => handle
            .add_member(Member::new(id, address))
            .await
            .map(ClientResponse::roster),
        ClientRequest::RemoveMember { id } => handle
            .remove_member(MemberId::from(id))
            .await
            .map(ClientResponse::roster),
        ClientRequest::Status => Ok(ClientResponse {
            ok: true,
            status: Some(handle.status()),
            leader: handle.leader(),
            ..Default::default()
        }),
    };
    result.unwrap_or_else(|e| {
        debug!("Client request failed: {}", e);
        ClientResponse::failed(&e)
    })
}

/// Client service speaking JSON lines over TCP
pub struct JsonLineService {
    listen: String,
    max_line_length: usize,
    handle: Option<SubmitHandle>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl JsonLineService {
    pub fn new(listen: impl Into<String>, max_line_length: usize) -> Self {
        Self {
            listen: listen.into(),
            max_line_length,
            handle: None,
            shutdown: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Service for JsonLineService {
    fn bind(&mut self, handle: SubmitHandle) {
        self.handle = Some(handle);
    }

    async fn start(&mut self) -> Result<()> {
        let handle = self.handle.clone().ok_or_else(|| {
            ReplicaError::Configuration("Client service started before it was bound".to_string())
        })?;
        let listener = TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        info!("Client service listening on {}", addr);

        self.task = Some(tokio::spawn(accept_loop(
            listener,
            handle,
            self.shutdown.clone(),
            self.max_line_length,
        )));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Client service task ended abnormally: {}", e);
            }
        }
        info!("Client service stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: SubmitHandle,
    shutdown: CancellationToken,
    max_line_length: usize,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Client connected from {}", addr);
                    let handle = handle.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, handle, shutdown, max_line_length).await {
                            warn!("Error serving client {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept client connection: {}", e);
                }
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    handle: SubmitHandle,
    shutdown: CancellationToken,
    max_line_length: usize,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(max_line_length));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = framed.next() => line,
        };
        let line = match line {
            None => return Ok(()),
            Some(line) => line
                .map_err(|e| ReplicaError::Network(format!("Failed to read request: {}", e)))?,
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ClientRequest>(&line) {
            Ok(request) => execute(&handle, request).await,
            Err(e) => ClientResponse::invalid(format!("Invalid request: {}", e)),
        };
        framed
            .send(serde_json::to_string(&response)?)
            .await
            .map_err(|e| ReplicaError::Network(format!("Failed to write response: {}", e)))?;
    }
}
