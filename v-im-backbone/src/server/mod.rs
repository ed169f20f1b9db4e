//! 进程装配：共享基础设施、网关与后台消费者
//! Process assembly: shared infrastructure, gateways and background consumers

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::{LogBus, MessageBus, StartFrom, TOPIC_GROUP, TOPIC_OFFLINE};
use crate::cluster::directory::Directory;
use crate::config::BackboneConfig;
use crate::dedup::{DedupStore, SledDedup};
use crate::error::{ImError, ImResult};
use crate::gateway::{Gateway, GatewayDeps, GroupMembershipCache};
use crate::registry::{LeaseManager, MemoryRegistry};
use crate::router::forward::ClusterForwarder;
use crate::router::MessageRouter;
use crate::sequence::{SequenceGenerator, SledSequence};
use crate::service::auth::{Authenticator, HttpAuthenticator, TrustAuthenticator};
use crate::service::filter::{FilterChain, SensitiveWordFilter};
use crate::service::membership::{HttpMembershipService, LocalMembership, MembershipService};
use crate::storage::Storage;
use crate::worker::archive::ARCHIVE_GROUP;
use crate::worker::offline::OFFLINE_GROUP;
use crate::worker::{drive, DriveConfig, GroupArchiver, OfflineWorker};

/// 一个进程内的完整骨干 / A complete backbone in one process
pub struct Backbone {
    config: BackboneConfig,
    storage: Arc<Storage>,
    registry: Arc<MemoryRegistry>,
    bus: LogBus,
    dedup: Arc<dyn DedupStore>,
    membership: Arc<dyn MembershipService>,
    local_membership: Option<Arc<LocalMembership>>,
    authenticator: Arc<dyn Authenticator>,
    directory: Directory,
    router: Arc<MessageRouter>,
    drive: DriveConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Backbone {
    /// 按配置打开存储并启动工作者 / Open storage and start the workers from config
    pub async fn start(config: BackboneConfig) -> ImResult<Self> {
        let authenticator: Arc<dyn Authenticator> = if config.auth.enabled {
            Arc::new(HttpAuthenticator::new(
                config.auth.center_url.clone(),
                Duration::from_millis(config.auth.timeout_ms),
            )?)
        } else {
            warn!("🔓 auth disabled, tokens are trusted as user ids");
            Arc::new(TrustAuthenticator)
        };
        Self::start_with_auth(config, authenticator).await
    }

    pub async fn start_with_auth(
        config: BackboneConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> ImResult<Self> {
        let db = match &config.storage_path {
            Some(path) => sled::open(path)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        let storage = Arc::new(Storage::from_db(db.clone())?);
        let sequences: Arc<dyn SequenceGenerator> = Arc::new(SledSequence::open(&db)?);
        let dedup: Arc<dyn DedupStore> = Arc::new(SledDedup::open(&db)?);
        let registry = Arc::new(MemoryRegistry::new());
        let bus = LogBus::persistent(&db, config.bus_partitions)?;
        let bus_dyn: Arc<dyn MessageBus> = Arc::new(bus.clone());

        let (membership, local_membership) = match &config.membership.service_url {
            Some(url) => {
                let remote: Arc<dyn MembershipService> = Arc::new(HttpMembershipService::new(
                    url.clone(),
                    Duration::from_millis(config.auth.timeout_ms),
                )?);
                (remote, None)
            }
            None => {
                let local = Arc::new(LocalMembership::new(bus_dyn.clone()));
                (local.clone() as Arc<dyn MembershipService>, Some(local))
            }
        };

        let filters = Arc::new(FilterChain::new());
        if !config.filter.sensitive_words.is_empty() {
            filters.register(Arc::new(SensitiveWordFilter::new(
                config.filter.sensitive_words.clone(),
                config.filter.mode,
            )));
        }

        let directory = Directory::new();
        let forwarder = Arc::new(ClusterForwarder::new(
            directory.clone(),
            config.router.fast_path_timeout,
        )?);
        let router = Arc::new(MessageRouter::new(
            sequences,
            registry.clone(),
            bus_dyn,
            forwarder,
            filters,
            config.router.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let backbone = Self {
            config,
            storage,
            registry,
            bus,
            dedup,
            membership,
            local_membership,
            authenticator,
            directory,
            router,
            drive: DriveConfig::default(),
            shutdown_tx,
        };
        backbone.spawn_workers().await?;
        info!(
            bus_partitions = backbone.config.bus_partitions,
            offline_workers = backbone.config.offline.workers,
            storage = backbone.config.storage_path.as_deref().unwrap_or("temporary"),
            "✅ backbone ready"
        );
        Ok(backbone)
    }

    async fn spawn_workers(&self) -> ImResult<()> {
        let node = &self.config.server.node_id;
        self.registry.spawn_reaper(
            Duration::from_millis(self.config.registry.propagation_interval_ms.max(1)),
            self.shutdown_tx.subscribe(),
        );

        let persist_ttl = Duration::from_millis(self.config.dedup.persist_ttl_ms);
        for i in 0..self.config.offline.workers {
            let worker_id = format!("{}-offline-{}", node, i);
            let consumer = self
                .bus
                .subscribe(OFFLINE_GROUP, TOPIC_OFFLINE, &worker_id, StartFrom::Earliest)
                .await?;
            let worker = OfflineWorker::new(
                worker_id,
                self.storage.clone(),
                self.dedup.clone(),
                persist_ttl,
            );
            tokio::spawn(drive(
                consumer,
                Arc::new(worker),
                self.drive.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        let consumer = self
            .bus
            .subscribe(
                ARCHIVE_GROUP,
                TOPIC_GROUP,
                &format!("{}-archiver", node),
                StartFrom::Earliest,
            )
            .await?;
        tokio::spawn(drive(
            consumer,
            Arc::new(GroupArchiver::new(self.storage.clone())),
            self.drive.clone(),
            self.shutdown_tx.subscribe(),
        ));

        crate::tasks::purge::spawn_purge_task(
            self.storage.clone(),
            self.dedup.clone(),
            self.bus.clone(),
            Duration::from_millis(self.config.offline.retention_ms),
            Duration::from_millis(self.config.offline.purge_interval_ms.max(1)),
            self.shutdown_tx.subscribe(),
        );
        Ok(())
    }

    /// 启动一个网关并登记到目录 / Start a gateway and register it in the directory
    pub async fn spawn_gateway(
        &self,
        node_id: impl Into<String>,
        http_addr: Option<String>,
    ) -> ImResult<Arc<Gateway>> {
        let node_id = node_id.into();
        if self.directory.get_gateway(&node_id).is_some() {
            return Err(ImError::PermanentReject(format!(
                "gateway {} already running",
                node_id
            )));
        }
        let deps = GatewayDeps {
            registry: self.registry.clone(),
            router: self.router.clone(),
            dedup: self.dedup.clone(),
            bus: Arc::new(self.bus.clone()),
            membership: Arc::new(GroupMembershipCache::new(
                self.membership.clone(),
                Duration::from_millis(self.config.membership.cache_ttl_ms),
            )),
            authenticator: self.authenticator.clone(),
            storage: self.storage.clone(),
        };
        let gateway = Gateway::new(node_id, self.config.gateway_config(), deps);
        self.directory.register_gateway(gateway.clone(), http_addr);
        gateway.spawn_background(self.drive.clone()).await?;
        info!(node_id = gateway.node_id(), "🛰️ gateway joined");
        Ok(gateway)
    }

    /// 摘除并停止网关，关闭其全部会话 / Remove a gateway and close all of its sessions
    pub async fn stop_gateway(&self, node_id: &str) -> bool {
        match self.directory.remove_gateway(node_id) {
            Some(gateway) => {
                gateway.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// 摘除网关但不做任何清理，租约只能靠过期消失
    /// Remove a gateway without any cleanup, its leases can only lapse
    pub fn crash_gateway(&self, node_id: &str) -> bool {
        match self.directory.remove_gateway(node_id) {
            Some(gateway) => {
                gateway.halt();
                true
            }
            None => false,
        }
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn registry(&self) -> Arc<dyn LeaseManager> {
        self.registry.clone()
    }

    pub fn bus(&self) -> &LogBus {
        &self.bus
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// 仅在未配置外部成员服务时可用 / Only present without an external membership service
    pub fn local_membership(&self) -> Option<&Arc<LocalMembership>> {
        self.local_membership.as_ref()
    }

    pub async fn shutdown(&self) {
        for gateway in self.directory.local_gateways() {
            self.stop_gateway(gateway.node_id()).await;
        }
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.storage.db().flush_async().await {
            warn!(error = %e, "⚠️ final flush failed");
        }
        info!("🛑 backbone stopped");
    }
}
