use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use infomesh_config::InfomeshConfig;
use infomesh_crypto::{generate_ed25519, KeyMaterial};
use infomesh_ledger::CreditLedger;
use infomesh_scheduler::EnergyAwareScheduler;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// A fully wired local node: credit ledger, energy-aware scheduler, and
/// the node's signing identity. The P2P transport and CLI layers wrap
/// this to do actual work.
pub struct Node {
    pub ledger: CreditLedger,
    pub scheduler: EnergyAwareScheduler,
    pub identity: KeyMaterial,
}

pub async fn build_node(config: &InfomeshConfig) -> Result<Node> {
    let identity = load_or_create_identity(&config.node.data_dir)?;
    let ledger = CreditLedger::connect(&config.db.url, config.db.pool_size, config.node.peer_id.clone())
        .await?
        .with_signing_key(identity.secret_key);
    Ok(Node { ledger, scheduler: EnergyAwareScheduler::new(), identity })
}

fn expand_data_dir(data_dir: &str) -> PathBuf {
    match data_dir.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_else(std::env::temp_dir).join(rest),
        None => PathBuf::from(data_dir),
    }
}

fn identity_path(data_dir: &str) -> PathBuf {
    expand_data_dir(data_dir).join("identity.json")
}

/// Load this node's Ed25519 signing identity from `data_dir`, generating
/// and persisting one on first run. Every `record_action` call signs with
/// this key and every credit proof carries its public half, so the
/// identity must stay stable across process invocations — the CLI
/// reconnects to a fresh `Node` on every subcommand, and a proof sampling
/// entries recorded in earlier sessions only verifies if they all share
/// the same key.
fn load_or_create_identity(data_dir: &str) -> Result<KeyMaterial> {
    let path = identity_path(data_dir);
    if path.exists() {
        let bytes = fs::read(&path)?;
        return Ok(serde_json::from_slice(&bytes)?);
    }

    let identity = generate_ed25519();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(&identity)?)?;
    info!(event = "node_identity_created", path = %path.display());
    Ok(identity)
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info` when unset.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_generated_once_and_then_reused() {
        let dir = std::env::temp_dir().join(format!("infomesh-node-test-{}", std::process::id()));
        let data_dir = dir.to_str().unwrap().to_string();
        let _ = fs::remove_dir_all(&dir);

        let first = load_or_create_identity(&data_dir).unwrap();
        let second = load_or_create_identity(&data_dir).unwrap();
        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.secret_key, second.secret_key);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tilde_data_dir_expands_under_home() {
        let path = expand_data_dir("~/.infomesh");
        assert!(path.ends_with(".infomesh"));
        assert!(path.is_absolute() || dirs::home_dir().is_none());
    }
}
