use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ce_provisioner::activation::{
    ActivationOrchestrator, ActivationService, ActivationStateTracker, ServiceRegistry,
};
use ce_provisioner::config::{Config, StoreBackend};
use ce_provisioner::db::{DataStore, MemoryStore, Store};
use ce_provisioner::drivers::{
    DeviceConfigurator, DriverRepository, EtreeDriverBuilder, LoggingConfigurator, VlanTaggedDriverBuilder,
};
use ce_provisioner::topology::{EndpointTopologyResolver, SipParser};
use ce_provisioner::vlan::{EtreeVlanPool, VlanPools};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ce_provisioner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let cfg = Config::load();

    // Initialize store
    let store: Arc<dyn DataStore> = match cfg.store_backend {
        StoreBackend::Sqlite => {
            let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections)
                .await
                .with_context(|| format!("Failed to open store at {}", cfg.db_path))?;
            tracing::info!("Store opened at {}", cfg.db_path);
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - activation state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // VLAN pools, scoped to this controller
    let pools = Arc::new(VlanPools::new(cfg.controller_id.clone(), cfg.vlan_range()?, store.clone()));
    let etree_pool = Arc::new(
        EtreeVlanPool::open(
            &cfg.controller_id,
            cfg.etree_root_range()?,
            cfg.etree_cpe_range()?,
            cfg.etree_spe_base,
            store.clone(),
        )
        .await
        .context("Failed to open E-Tree VLAN pool")?,
    );

    // Driver repository: E-Tree first so rooted-multipoint endpoints never
    // fall through to the pair-based driver
    let parser = SipParser::new(cfg.sip_delimiter.clone());
    let configurator: Arc<dyn DeviceConfigurator> = Arc::new(LoggingConfigurator);
    let mut repository = DriverRepository::new();
    repository.register(Arc::new(EtreeDriverBuilder::new(
        parser.clone(),
        pools.clone(),
        etree_pool,
        configurator.clone(),
    )));
    repository.register(Arc::new(VlanTaggedDriverBuilder::new(
        "vlan-tagged",
        parser.clone(),
        pools,
        configurator,
    )));

    let tracker = ActivationStateTracker::new(store.clone());
    let orchestrator = Arc::new(ActivationOrchestrator::new(
        EndpointTopologyResolver::new(parser),
        Arc::new(repository),
        tracker,
    ));
    let _activation = ActivationService::new(ServiceRegistry::new(store), orchestrator, cfg.request_queue_depth);

    tracing::info!("Controller {} ready", cfg.controller_id);

    shutdown_signal().await;
    tracing::info!("Shutting down controller {}", cfg.controller_id);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
