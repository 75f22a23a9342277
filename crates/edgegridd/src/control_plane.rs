//! Control plane assembly.
//!
//! Startup order matters: the controller registers its caches before the
//! sync engine starts, and the engine has replayed the store before the
//! notify server takes its first agent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use edgegrid_controller::{AgentBehavior, Controller, DummyAgent, NotifyServer, Settings};
use edgegrid_core::{Cloudlet, CloudletKey, ControllerConfig, Flavor, FlavorKey, IpSupport, PlatformType};
use edgegrid_store::{KvStore, RedbStore, StmConfig, run_lease_reaper};
use edgegrid_sync::SyncEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

const DB_FILE: &str = "edgegrid.redb";

pub struct ControlPlane {
    pub controller: Controller,
    pub notify: Arc<NotifyServer>,
    sync: Arc<SyncEngine>,
    shutdown: watch::Sender<bool>,
    reaper: JoinHandle<()>,
    demo_agent: Option<DummyAgent>,
}

impl ControlPlane {
    /// Open the persistent store under `data_dir` and start.
    pub async fn open(config: &ControllerConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let store = RedbStore::open(&db_path)?;
        info!(path = ?db_path, "store opened");
        Self::start(config, Arc::new(store)).await
    }

    pub async fn in_memory(config: &ControllerConfig) -> anyhow::Result<Self> {
        Self::start(config, Arc::new(RedbStore::open_in_memory()?)).await
    }

    pub async fn start(config: &ControllerConfig, store: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let sync = SyncEngine::new(Arc::clone(&store), config.region, StmConfig::from(&config.stm));
        let controller = Controller::new(Arc::clone(&sync), Settings::from_config(config));
        sync.start().await?;
        info!(region = config.region, revision = sync.revision(), "caches synced");

        let notify = NotifyServer::new(controller.clone());
        notify.start();

        let (shutdown, stopped) = watch::channel(false);
        let reaper = tokio::spawn(run_lease_reaper(
            store,
            Duration::from_millis(config.leases.reaper_interval_ms),
            stopped,
        ));

        Ok(Self {
            controller,
            notify,
            sync,
            shutdown,
            reaper,
            demo_agent: None,
        })
    }

    /// Register `key` as a fake cloudlet, if it is not there yet, and
    /// attach an in-process agent to it.
    pub async fn start_demo(&mut self, key: CloudletKey) -> anyhow::Result<()> {
        let flavor = FlavorKey::new("demo.small");
        if !self.controller.caches().flavor.has_key(&flavor) {
            self.controller
                .create_flavor(Flavor {
                    key: flavor,
                    ram_mb: 2048,
                    vcpus: 2,
                    disk_gb: 20,
                })
                .await?;
        }
        if !self.controller.caches().cloudlet.has_key(&key) {
            self.controller
                .create_cloudlet(Cloudlet {
                    key: key.clone(),
                    platform_type: PlatformType::Fake,
                    ip_support: IpSupport::Dynamic,
                    num_dynamic_ips: 10,
                })
                .await?;
        }
        let agent = DummyAgent::connect(&self.notify, key.clone(), AgentBehavior::default());
        info!(cloudlet = %key, conn_id = agent.conn_id(), "demo agent attached");
        self.demo_agent = Some(agent);
        Ok(())
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub async fn shutdown(mut self) {
        if let Some(mut agent) = self.demo_agent.take() {
            agent.disconnect();
        }
        self.notify.stop();
        self.sync.stop();
        let _ = self.shutdown.send(true);
        let _ = (&mut self.reaper).await;
        info!("control plane stopped");
    }
}
