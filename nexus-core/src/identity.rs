//! Local node identity
//!
//! The node id is an opaque hex string. It comes from configuration when
//! set; otherwise a random one is generated once and kept in
//! `<data_dir>/node_id` so it survives restarts.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::peer::Role;

const NODE_ID_FILE: &str = "node_id";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid node id in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Who this node is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub role: Role,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, role: Role) -> Self {
        Self {
            node_id: node_id.into(),
            role,
        }
    }

    /// Read the persisted id under `data_dir`, creating it on first run
    pub fn load_or_create(data_dir: &Path, role: Role) -> Result<Self, IdentityError> {
        let path = data_dir.join(NODE_ID_FILE);

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let node_id = raw.trim().to_string();
                if node_id.is_empty() || hex::decode(&node_id).is_err() {
                    return Err(IdentityError::Invalid {
                        path,
                        reason: "expected a hex string".to_string(),
                    });
                }
                debug!(node_id = %node_id, "Loaded node id");
                Ok(Self::new(node_id, role))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let node_id = generate_node_id();
                std::fs::create_dir_all(data_dir)?;
                std::fs::write(&path, format!("{}\n", node_id))?;
                info!(node_id = %node_id, path = %path.display(), "Generated new node id");
                Ok(Self::new(node_id, role))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// SHA-256 of fresh random bytes, hex encoded
pub fn generate_node_id() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(Sha256::digest(seed))
}
