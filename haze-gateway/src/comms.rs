#![forbid(unsafe_code)]

//! Outbound connections: the host table, the comms trait every transport
//! implements, and the TCP client used in production. All sends are subject
//! to the fixed 1.3 s timeout applied by the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use haze_core::id::Id;
use haze_core::{HazeError, HazeResult};
use haze_gossip::{GossipMessage, GossipTransport};

use crate::rpc::{
    Batch, GatewaySlot, GatewaySlotResponse, GatewaySlots, GetMessages, GetMessagesResponse,
    HistoricalRounds, HistoricalRoundsResponse, NotificationBatch, SignedClientKeyRequest,
    SignedKeyResponse,
};

/// Upper bound on one frame, shared by client and server.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A known remote endpoint.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: Id,
    pub address: String,
    connected: Arc<AtomicBool>,
}

impl Host {
    pub fn new(id: Id, address: String) -> Self {
        Host {
            id,
            address,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
    }
}

/// Identifier-keyed table of known hosts.
#[derive(Default, Clone)]
pub struct HostTable {
    hosts: Arc<Mutex<HashMap<Id, Host>>>,
}

impl HostTable {
    pub fn new() -> Self {
        HostTable::default()
    }

    pub fn add(&self, host: Host) {
        self.hosts.lock().insert(host.id, host);
    }

    pub fn get(&self, id: &Id) -> Option<Host> {
        self.hosts.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &Id) {
        self.hosts.lock().remove(id);
    }
}

/// Every RPC this gateway sends to a sibling, the fronted server, or the
/// notification dispatcher.
#[async_trait]
pub trait Comms: Send + Sync {
    async fn send_put_message(
        &self,
        host: &Host,
        msg: &GatewaySlot,
    ) -> HazeResult<GatewaySlotResponse>;

    async fn send_put_many_messages(
        &self,
        host: &Host,
        msgs: &GatewaySlots,
    ) -> HazeResult<GatewaySlotResponse>;

    async fn send_request_messages(
        &self,
        host: &Host,
        req: &GetMessages,
    ) -> HazeResult<GetMessagesResponse>;

    async fn send_request_historical_rounds(
        &self,
        host: &Host,
        req: &HistoricalRounds,
    ) -> HazeResult<HistoricalRoundsResponse>;

    async fn send_request_client_key(
        &self,
        host: &Host,
        req: &SignedClientKeyRequest,
    ) -> HazeResult<SignedKeyResponse>;

    async fn upload_unmixed_batch(&self, host: &Host, batch: &Batch) -> HazeResult<()>;

    async fn send_notification_batch(
        &self,
        host: &Host,
        batch: &NotificationBatch,
    ) -> HazeResult<()>;

    async fn send_gossip(&self, host: &Host, msg: &GossipMessage) -> HazeResult<()>;
}

/// One request frame on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub body: Vec<u8>,
}

/// One response frame on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub body: Vec<u8>,
    pub error: Option<String>,
}

pub async fn write_frame<T: Serialize>(
    stream: &mut (impl AsyncWriteExt + Unpin),
    value: &T,
) -> HazeResult<()> {
    let raw = serde_cbor::to_vec(value)?;
    if raw.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(HazeError::Invalid("frame too large".into()));
    }
    stream.write_all(&(raw.len() as u32).to_be_bytes()).await?;
    stream.write_all(&raw).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T: DeserializeOwned>(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> HazeResult<T> {
    let mut len_raw = [0u8; 4];
    stream.read_exact(&mut len_raw).await?;
    let len = u32::from_be_bytes(len_raw);
    if len > MAX_FRAME_LEN {
        return Err(HazeError::Invalid(format!("frame of {len} bytes refused")));
    }
    let mut raw = vec![0u8; len as usize];
    stream.read_exact(&mut raw).await?;
    serde_cbor::from_slice(&raw).map_err(HazeError::from)
}

/// TCP client speaking the framed-CBOR RPC dialect.
#[derive(Default)]
pub struct TcpComms;

impl TcpComms {
    pub fn new() -> Self {
        TcpComms
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        host: &Host,
        method: &str,
        body: &Req,
    ) -> HazeResult<Resp> {
        let mut stream = match TcpStream::connect(&host.address).await {
            Ok(stream) => {
                host.set_connected(true);
                stream
            }
            Err(e) => {
                host.set_connected(false);
                return Err(HazeError::NotConnected(format!("{}: {e}", host.address)));
            }
        };

        write_frame(
            &mut stream,
            &RpcRequest {
                method: method.to_owned(),
                body: serde_cbor::to_vec(body)?,
            },
        )
        .await?;

        let reply: RpcResponse = read_frame(&mut stream).await?;
        if let Some(error) = reply.error {
            return Err(HazeError::Internal(error));
        }
        serde_cbor::from_slice(&reply.body).map_err(HazeError::from)
    }
}

#[async_trait]
impl Comms for TcpComms {
    async fn send_put_message(
        &self,
        host: &Host,
        msg: &GatewaySlot,
    ) -> HazeResult<GatewaySlotResponse> {
        self.call(host, "PutMessage", msg).await
    }

    async fn send_put_many_messages(
        &self,
        host: &Host,
        msgs: &GatewaySlots,
    ) -> HazeResult<GatewaySlotResponse> {
        self.call(host, "PutManyMessages", msgs).await
    }

    async fn send_request_messages(
        &self,
        host: &Host,
        req: &GetMessages,
    ) -> HazeResult<GetMessagesResponse> {
        self.call(host, "RequestMessages", req).await
    }

    async fn send_request_historical_rounds(
        &self,
        host: &Host,
        req: &HistoricalRounds,
    ) -> HazeResult<HistoricalRoundsResponse> {
        self.call(host, "RequestHistoricalRounds", req).await
    }

    async fn send_request_client_key(
        &self,
        host: &Host,
        req: &SignedClientKeyRequest,
    ) -> HazeResult<SignedKeyResponse> {
        self.call(host, "RequestClientKey", req).await
    }

    async fn upload_unmixed_batch(&self, host: &Host, batch: &Batch) -> HazeResult<()> {
        self.call(host, "UploadUnmixedBatch", batch).await
    }

    async fn send_notification_batch(
        &self,
        host: &Host,
        batch: &NotificationBatch,
    ) -> HazeResult<()> {
        self.call(host, "NotificationBatch", batch).await
    }

    async fn send_gossip(&self, host: &Host, msg: &GossipMessage) -> HazeResult<()> {
        self.call(host, "Gossip", msg).await
    }
}

/// Adapter giving the gossip layer a peer-addressed view of [`Comms`].
pub struct CommsGossipTransport {
    pub comms: Arc<dyn Comms>,
    pub hosts: HostTable,
}

#[async_trait]
impl GossipTransport for CommsGossipTransport {
    async fn send_gossip(&self, peer: &Id, msg: &GossipMessage) -> HazeResult<()> {
        let host = self
            .hosts
            .get(peer)
            .ok_or_else(|| HazeError::NoTarget(format!("gossip peer {peer}")))?;
        self.comms.send_gossip(&host, msg).await
    }
}
