#![forbid(unsafe_code)]

//! Network definition file: the signed directory of nodes, gateways, and
//! their published keys. Parsing and trust-anchor verification of the file
//! itself happen upstream; this module only reads the directory.

use std::fs;
use std::path::Path;

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use haze_core::id::Id;
use haze_core::{HazeError, HazeResult};
use haze_crypto::signature;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdfGateway {
    pub id: Id,
    pub address: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdfNode {
    pub id: Id,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdfNotification {
    pub id: Id,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    #[serde(default)]
    pub gateways: Vec<NdfGateway>,
    #[serde(default)]
    pub nodes: Vec<NdfNode>,
    #[serde(default)]
    pub notification: Option<NdfNotification>,
    /// Width of one cMix payload half, fixed network-wide.
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,
    /// Meaningful bits of an ephemeral identifier, network-wide default.
    #[serde(default = "default_address_space")]
    pub address_space_size: u8,
}

fn default_payload_len() -> usize {
    256
}

fn default_address_space() -> u8 {
    16
}

impl NetworkDefinition {
    pub fn from_file(path: &Path) -> HazeResult<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| HazeError::Invalid(format!("unreadable NDF: {e}")))
    }

    pub fn gateway(&self, id: &Id) -> Option<&NdfGateway> {
        self.gateways.iter().find(|g| &g.id == id)
    }

    /// Published key of a sibling gateway, for envelope verification.
    pub fn gateway_public_key(&self, id: &Id) -> HazeResult<RsaPublicKey> {
        let gw = self
            .gateway(id)
            .ok_or_else(|| HazeError::NotFound(format!("gateway {id} not in NDF")))?;
        signature::public_key_from_pem(&gw.public_key_pem)
    }
}
