#![forbid(unsafe_code)]

//! Inbound RPC dispatch: a length-prefixed CBOR frame per request, one task
//! per connection, errors reported as short non-leaking strings.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use haze_core::{HazeError, HazeResult};
use haze_gossip::GossipMessage;

use crate::comms::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::instance::Instance;
use crate::rpc::{
    CompletedBatch, GatewaySlot, GatewaySlots, GetMessages, HistoricalRounds,
    SignedClientKeyRequest,
};

fn decode<T: DeserializeOwned>(body: &[u8]) -> HazeResult<T> {
    serde_cbor::from_slice(body)
        .map_err(|e| HazeError::Invalid(format!("malformed request body: {e}")))
}

fn encode<T: Serialize>(value: &T) -> HazeResult<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(HazeError::from)
}

async fn dispatch(instance: &Arc<Instance>, req: RpcRequest, ip: &str) -> HazeResult<Vec<u8>> {
    match req.method.as_str() {
        "PutMessage" => {
            let msg: GatewaySlot = decode(&req.body)?;
            encode(&instance.put_message(msg, ip).await?)
        }
        "PutManyMessages" => {
            let msgs: GatewaySlots = decode(&req.body)?;
            encode(&instance.put_many_messages(msgs, ip).await?)
        }
        "RequestMessages" => {
            let get: GetMessages = decode(&req.body)?;
            encode(&instance.request_messages(get).await?)
        }
        "RequestHistoricalRounds" => {
            let get: HistoricalRounds = decode(&req.body)?;
            encode(&instance.request_historical_rounds(get).await?)
        }
        "RequestClientKey" => {
            let signed: SignedClientKeyRequest = decode(&req.body)?;
            encode(&instance.request_client_key(signed).await?)
        }
        "UploadUnmixedBatch" => {
            let round: haze_core::rounds::Round = decode(&req.body)?;
            instance.upload_unmixed_batch(&round).await;
            encode(&())
        }
        "ProcessCompletedBatch" => {
            let batch: CompletedBatch = decode(&req.body)?;
            instance
                .process_completed_batch(batch.slots, batch.round_id)
                .await?;
            encode(&())
        }
        "RoundUpdate" => {
            let round: haze_core::rounds::Round = decode(&req.body)?;
            instance.round_update(round)?;
            encode(&())
        }
        "Gossip" => {
            let msg: GossipMessage = decode(&req.body)?;
            match instance.gossip_manager() {
                Some(manager) => {
                    manager.receive(&msg)?;
                    encode(&())
                }
                None => Err(HazeError::Internal("gossip disabled".into())),
            }
        }
        other => Err(HazeError::Invalid(format!("unknown method {other}"))),
    }
}

async fn handle_connection(instance: Arc<Instance>, mut stream: TcpStream, ip: String) {
    loop {
        let req: RpcRequest = match read_frame(&mut stream).await {
            Ok(req) => req,
            Err(HazeError::Io(_)) => return,
            Err(e) => {
                debug!("dropping connection from {ip}: {e}");
                return;
            }
        };

        let method = req.method.clone();
        let reply = match dispatch(&instance, req, &ip).await {
            Ok(body) => RpcResponse { body, error: None },
            Err(e) => {
                debug!(%method, "request from {ip} failed: {e}");
                RpcResponse {
                    body: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        if write_frame(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

/// Accept loop; every connection gets its own task.
pub async fn serve(instance: Arc<Instance>, listener: TcpListener) -> HazeResult<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let ip = peer.ip().to_string();
        tokio::spawn(handle_connection(Arc::clone(&instance), stream, ip));
    }
}
