#![forbid(unsafe_code)]

//! Gateway daemon entry point: configuration, identity, storage selection,
//! and background task startup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use haze_core::config::GatewayConfig;
use haze_core::id::{Id, IdKind};
use haze_crypto::signature;
use haze_gateway::comms::TcpComms;
use haze_gateway::instance::Instance;
use haze_gateway::ndf::NetworkDefinition;
use haze_gateway::server;
use haze_gossip::ManagerFlags;
use haze_storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "haze-gateway", about = "cMix gateway node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "gateway.toml")]
    config: String,
}

fn load_identity(cfg: &GatewayConfig) -> Result<(Id, rsa::RsaPrivateKey)> {
    let idf = Path::new(&cfg.idf_path);
    let id = if idf.exists() {
        let raw = std::fs::read(idf).context("reading identity file")?;
        Id::from_bytes(&raw).context("parsing identity file")?
    } else if cfg.dev_mode {
        Id::from_label("dev-gateway", IdKind::Gateway)
    } else {
        anyhow::bail!("identity file {} not found", cfg.idf_path);
    };

    let key_path = Path::new(&cfg.key_path);
    let key = if key_path.exists() {
        let pem = std::fs::read_to_string(key_path).context("reading private key")?;
        signature::private_key_from_pem(&pem).context("parsing private key")?
    } else if cfg.dev_mode {
        info!("dev mode: generating an ephemeral keypair");
        signature::generate_keypair().context("generating keypair")?
    } else {
        anyhow::bail!("private key {} not found", cfg.key_path);
    };

    Ok((id, key))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let cfg = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;

    let (id, private_key) = load_identity(&cfg)?;
    info!(%id, "gateway identity loaded");

    let storage = if cfg.db_path.is_empty() {
        info!("using in-memory storage");
        Storage::in_memory()
    } else {
        Storage::durable(Path::new(&cfg.db_path)).context("opening durable storage")?
    };

    let ndf_path = Path::new(&cfg.ndf_path);
    let ndf = if ndf_path.exists() {
        NetworkDefinition::from_file(ndf_path).context("loading NDF")?
    } else if cfg.dev_mode {
        NetworkDefinition::default()
    } else {
        anyhow::bail!("NDF {} not found", cfg.ndf_path);
    };

    let bind = format!("{}:{}", cfg.listening_address, cfg.port);
    let gossip_flags = ManagerFlags {
        buffer_expiration: std::time::Duration::from_secs(cfg.gossip.buffer_expiration_secs),
        monitor_frequency: std::time::Duration::from_secs(cfg.gossip.monitor_frequency_secs),
    };

    let instance = Instance::new(
        cfg,
        id,
        Arc::new(private_key),
        storage,
        Arc::new(TcpComms::new()),
        ndf,
    );
    instance.init_gossip(gossip_flags);

    // Seed the peer sets with every sibling from the NDF.
    for gw in instance.ndf().gateways.clone() {
        if gw.id != instance.id() {
            instance.signal_add_gateway(gw.id);
        }
    }

    let mut tasks = vec![
        instance.start_peers_thread(),
        instance.rate_limit().spawn_reaper(),
        instance.message_rate_limit().spawn_reaper(),
        instance.spawn_cleanup(),
    ];
    if let Some(manager) = instance.gossip_manager() {
        tasks.push(manager.spawn_monitor());
    }

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "gateway listening");

    tokio::select! {
        result = server::serve(Arc::clone(&instance), listener) => {
            result.context("rpc server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    if let Some(manager) = instance.gossip_manager() {
        manager.kill();
    }
    instance.rate_limit().kill();
    instance.message_rate_limit().kill();
    for task in tasks {
        task.abort();
    }
    Ok(())
}
