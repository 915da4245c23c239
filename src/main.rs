use std::sync::Arc;

use clap::Parser;
use redis::aio::ConnectionManager;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodevisor::config::{AgentConfig, Cli};
use nodevisor::diagnostics::{hostname, Emitter, LogEmitter, RedisEmitter};
use nodevisor::engine::{Admission, AgentHandle, CreationEngine, OperateEngine, Shared, SystemLoad};
use nodevisor::error::QueueError;
use nodevisor::guest::QemuImgProvisioner;
use nodevisor::hypervisor::VirshHypervisor;
use nodevisor::queue::{RedisInstructionSource, RedisWorkQueue};
use nodevisor::storage::MountedVolumeStore;
use nodevisor::tracing::{init_tracing, shutdown_tracing};
use nodevisor::{metrics, AgentError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = AgentConfig::from_cli(&cli)?;

    init_tracing("nodevisor", &config.telemetry, config.debug)?;

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "agent exited with error");
    }

    shutdown_tracing();
    result.map_err(Into::into)
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let host = hostname();
    info!(host = %host, debug = config.debug, "starting nodevisor");

    // 1. Hypervisor session; the agent is useless without it
    let hypervisor = Arc::new(VirshHypervisor::open(&config.hypervisor).await?);

    // 2. Redis: queue, instruction channel, emit channel
    let client = redis::Client::open(config.redis.url.as_str()).map_err(QueueError::from)?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .map_err(QueueError::from)?;
    info!(url = %config.redis.url, "redis connected");

    let emitter: Arc<dyn Emitter> = if config.redis.emit_channel.is_empty() {
        Arc::new(LogEmitter)
    } else {
        Arc::new(RedisEmitter::new(
            conn.clone(),
            config.redis.emit_channel.clone(),
            host.clone(),
        ))
    };
    let queue = Arc::new(RedisWorkQueue::new(conn, config.redis.vm_create_queue.clone()));
    let source = RedisInstructionSource::subscribe(&client, &config.redis.instruction_channel).await?;

    // 3. Storage and provisioning
    let store = MountedVolumeStore::new(config.storage.mount_base.clone());
    let provisioner = Arc::new(QemuImgProvisioner::new(store.clone(), config.storage.qemu_img_bin.clone()));

    let shared = Shared {
        hypervisor,
        store: Arc::new(store),
        emitter,
    };

    let creation = CreationEngine::new(
        shared.clone(),
        provisioner,
        queue,
        Arc::new(SystemLoad),
        Admission::from(&config.admission),
        config.storage.instances_dir.clone(),
    );
    let operate = OperateEngine::new(
        shared,
        Box::new(source),
        config.operate.poll_timeout(),
        host,
        config.debug,
    );

    let cancel = CancellationToken::new();

    // 4. Optional metrics endpoint
    if let Some(addr) = config.telemetry.metrics_addr {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, cancel).await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    // 5. Engines
    let mut handle = AgentHandle::spawn(creation, operate, cancel);

    let mut sigterm = signal(SignalKind::terminate()).map_err(AgentError::Signal)?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = handle.wait_any() => warn!("an engine exited unexpectedly"),
    }

    info!("shutting down; waiting for in-flight iterations");
    handle.shutdown().await;
    Ok(())
}
