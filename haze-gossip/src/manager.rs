#![forbid(unsafe_code)]

//! Protocol registry plus the seen-message buffer that deduplicates inbound
//! envelopes across channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use haze_core::id::Id;
use haze_core::{HazeError, HazeResult};

use crate::message::GossipMessage;
use crate::protocol::{GossipTransport, Protocol, ProtocolFlags, ReceiveFn, VerifyFn};

#[derive(Debug, Clone, Copy)]
pub struct ManagerFlags {
    /// How long a seen digest suppresses redelivery.
    pub buffer_expiration: Duration,
    /// Cadence of the buffer monitor task.
    pub monitor_frequency: Duration,
}

impl Default for ManagerFlags {
    fn default() -> Self {
        ManagerFlags {
            buffer_expiration: Duration::from_secs(300),
            monitor_frequency: Duration::from_secs(150),
        }
    }
}

pub struct Manager {
    flags: ManagerFlags,
    origin: Id,
    signer: Arc<RsaPrivateKey>,
    transport: Arc<dyn GossipTransport>,
    protocols: Mutex<HashMap<String, Arc<Protocol>>>,
    seen: Arc<Mutex<HashMap<[u8; 32], Instant>>>,
    kill: Arc<Notify>,
}

impl Manager {
    pub fn new(
        flags: ManagerFlags,
        origin: Id,
        signer: Arc<RsaPrivateKey>,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        Manager {
            flags,
            origin,
            signer,
            transport,
            protocols: Mutex::new(HashMap::new()),
            seen: Arc::new(Mutex::new(HashMap::new())),
            kill: Arc::new(Notify::new()),
        }
    }

    /// Register a protocol channel under `tag`.
    pub fn new_gossip(
        &self,
        tag: &str,
        flags: ProtocolFlags,
        verify: VerifyFn,
        receive: ReceiveFn,
    ) -> Arc<Protocol> {
        let protocol = Arc::new(Protocol::new(
            tag.to_owned(),
            flags,
            self.origin,
            Arc::clone(&self.signer),
            Arc::clone(&self.transport),
            verify,
            receive,
        ));
        self.protocols
            .lock()
            .insert(tag.to_owned(), Arc::clone(&protocol));
        protocol
    }

    pub fn get(&self, tag: &str) -> Option<Arc<Protocol>> {
        self.protocols.lock().get(tag).cloned()
    }

    /// Dispatch one inbound envelope: drop duplicates, then verify and apply
    /// through the tagged protocol.
    pub fn receive(&self, msg: &GossipMessage) -> HazeResult<()> {
        let digest = msg.digest();
        {
            let mut seen = self.seen.lock();
            if seen.contains_key(&digest) {
                debug!(tag = %msg.tag, "dropping duplicate gossip");
                return Ok(());
            }
            seen.insert(digest, Instant::now());
        }

        let protocol = self
            .get(&msg.tag)
            .ok_or_else(|| HazeError::NotFound(format!("gossip protocol {}", msg.tag)))?;
        protocol.handle(msg)
    }

    /// Start the buffer monitor. Runs until [`Manager::kill`].
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let seen = Arc::clone(&self.seen);
        let expiration = self.flags.buffer_expiration;
        let frequency = self.flags.monitor_frequency;
        let kill = Arc::clone(&self.kill);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(frequency);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = Instant::now();
                        let mut map = seen.lock();
                        let before = map.len();
                        map.retain(|_, at| now.saturating_duration_since(*at) <= expiration);
                        if before != map.len() {
                            debug!(expired = before - map.len(), "gossip buffer pruned");
                        }
                    }
                    _ = kill.notified() => return,
                }
            }
        })
    }

    /// Stop background work and log the teardown of each channel.
    pub fn kill(&self) {
        self.kill.notify_waiters();
        for protocol in self.protocols.lock().values() {
            info!(tag = protocol.tag(), "gossip protocol shut down");
        }
    }
}
