//! Testing utilities and mock implementations of every collaborator.
//!
//! This module provides in-memory stand-ins for storage, consensus,
//! scripting, destinations and alerts, so pipelines can be driven end to end
//! without a database or a cluster.
//!
//! # Example
//!
//! ```rust,ignore
//! use changefeed_core::testing::{fixtures, Harness};
//!
//! let harness = Harness::new();
//! harness.storage.put_document("orders/1", "Orders", json!({"total": 10}));
//!
//! let engine = harness.engine(&fixtures::orders_configuration("orders-etl", "load(this)"));
//! engine.run_iteration().await?;
//! assert_eq!(harness.destination("orders-etl").loaded_items().len(), 1);
//! ```

mod mock_cluster;
mod mock_destination;
mod mock_notification_center;
mod mock_storage;
mod mock_transformer;

pub use mock_cluster::{MockConsensus, MockOwnership};
pub use mock_destination::{MockDestination, MockDestinationFactory};
pub use mock_notification_center::MockNotificationCenter;
pub use mock_storage::{MockChangeNotifications, MockStorage};
pub use mock_transformer::{MockScriptCompiler, MockTransformer};

use std::sync::Arc;

use crate::alerts::{create_alert_system, AlertHandle, AlertWriter};
use crate::config::EtlSettings;
use crate::engine::{EngineContext, PipelineEngine};
use crate::registry::{PipelineRegistry, RegistryContext};
use crate::resources::{CpuCreditsSignal, LowMemoryMonitor};
use crate::task::{DatabaseRecord, EtlConfiguration};

/// Every mock wired together for one database on node [`fixtures::NODE`].
pub struct Harness {
    pub storage: Arc<MockStorage>,
    pub notifications: Arc<MockChangeNotifications>,
    pub consensus: Arc<MockConsensus>,
    pub compiler: Arc<MockScriptCompiler>,
    pub destinations: Arc<MockDestinationFactory>,
    pub ownership: Arc<MockOwnership>,
    pub center: Arc<MockNotificationCenter>,
    pub cpu_credits: CpuCreditsSignal,
    pub low_memory: Arc<LowMemoryMonitor>,
    pub settings: EtlSettings,
    alerts: AlertHandle,
    writer: std::sync::Mutex<Option<AlertWriter>>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fixtures::settings())
    }

    pub fn with_settings(settings: EtlSettings) -> Self {
        let notifications = Arc::new(MockChangeNotifications::new());
        let storage = Arc::new(
            MockStorage::new(fixtures::NODE, fixtures::DATABASE_ID)
                .with_notifications(Arc::clone(&notifications)),
        );
        let center = Arc::new(MockNotificationCenter::new());
        let (alerts, writer) = create_alert_system(center.clone(), 1024);

        Self {
            storage,
            notifications,
            consensus: Arc::new(MockConsensus::new()),
            compiler: Arc::new(MockScriptCompiler::new()),
            destinations: Arc::new(MockDestinationFactory::new()),
            ownership: Arc::new(MockOwnership::node(fixtures::NODE)),
            center,
            cpu_credits: CpuCreditsSignal::new(),
            low_memory: LowMemoryMonitor::new(),
            settings,
            alerts,
            writer: std::sync::Mutex::new(Some(writer)),
        }
    }

    /// Forward alerts to [`Self::center`]. Call once from inside a runtime.
    pub fn spawn_alert_writer(&self) {
        if let Some(writer) = crate::sync::lock(&self.writer).take() {
            tokio::spawn(writer.run());
        }
    }

    pub fn engine_context(&self) -> EngineContext {
        EngineContext::new(
            fixtures::DATABASE,
            fixtures::NODE,
            self.storage.clone(),
            self.consensus.clone(),
            self.compiler.clone(),
        )
        .with_settings(self.settings.clone())
        .with_alerts(self.alerts.clone())
        .with_cpu_credits(self.cpu_credits.clone())
        .with_low_memory(Arc::clone(&self.low_memory))
    }

    pub fn registry_context(&self) -> RegistryContext {
        RegistryContext::new(
            self.engine_context(),
            self.ownership.clone(),
            self.destinations.clone(),
        )
        .with_notifications(self.notifications.clone())
    }

    pub fn registry(&self) -> PipelineRegistry {
        PipelineRegistry::new(self.registry_context())
    }

    /// An unstarted engine for the first transformation of `configuration`,
    /// resolved against [`fixtures::database_record`].
    pub fn engine(&self, configuration: &EtlConfiguration) -> Arc<PipelineEngine> {
        self.engine_with_context(self.engine_context(), configuration)
    }

    pub fn engine_with_context(
        &self,
        ctx: EngineContext,
        configuration: &EtlConfiguration,
    ) -> Arc<PipelineEngine> {
        let record = fixtures::database_record(vec![configuration.clone()]);
        let resolved = crate::task::ResolvedConfiguration {
            configuration: configuration.clone(),
            connection: record
                .connection_string(&configuration.connection_string_name)
                .cloned()
                .unwrap_or_else(fixtures::warehouse_connection),
        };
        let transformation = &configuration.transformations[0];
        let destination = self
            .destinations
            .destination(&configuration.name, configuration.kind);
        PipelineEngine::new(ctx, &resolved, transformation, destination)
    }

    /// The recorder behind `configuration`'s engines.
    pub fn destination(&self, configuration: &str) -> Arc<MockDestination> {
        let kind = fixtures::kind_of(configuration);
        self.destinations.destination(configuration, kind)
    }

    pub fn record(&self, configurations: Vec<EtlConfiguration>) -> DatabaseRecord {
        fixtures::database_record(configurations)
    }
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::time::Duration;

    use crate::config::EtlSettings;
    use crate::task::{
        ConnectionString, DatabaseRecord, DatabaseTopology, DestinationKind, EtlConfiguration,
        Transformation,
    };

    pub const DATABASE: &str = "shop";
    pub const DATABASE_ID: &str = "dbA";
    pub const NODE: &str = "A";
    pub const OTHER_NODE: &str = "B";

    /// Relational connection string used by configurations named without `peer`.
    pub const WAREHOUSE: &str = "warehouse";
    /// Peer connection string.
    pub const REPLICA: &str = "replica";

    /// Settings with short waits so tests stay fast.
    pub fn settings() -> EtlSettings {
        let mut settings = EtlSettings::default()
            .with_cpu_credits_wait(Duration::from_millis(10))
            .with_storage_retry_delay(Duration::from_millis(10));
        settings.transient_retry_delay_ms = 1;
        settings.commit_wait_timeout_secs = 1;
        settings
    }

    pub fn warehouse_connection() -> ConnectionString {
        ConnectionString::new(WAREHOUSE, DestinationKind::Relational, "postgres://warehouse/shop")
    }

    pub fn replica_connection() -> ConnectionString {
        ConnectionString::new(REPLICA, DestinationKind::Peer, "https://replica:8080")
    }

    /// Peer configurations are recognized by name.
    pub fn kind_of(configuration: &str) -> DestinationKind {
        if configuration.to_lowercase().contains("peer") {
            DestinationKind::Peer
        } else {
            DestinationKind::Relational
        }
    }

    /// Relational configuration with one transformation over `Orders`.
    pub fn orders_configuration(name: &str, script: &str) -> EtlConfiguration {
        EtlConfiguration::new(name, DestinationKind::Relational, WAREHOUSE).with_transformation(
            Transformation::new("orders", script).with_collections(["Orders"]),
        )
    }

    /// Peer configuration with one transformation over every collection.
    pub fn peer_configuration(name: &str, script: &str) -> EtlConfiguration {
        EtlConfiguration::new(name, DestinationKind::Peer, REPLICA)
            .with_transformation(Transformation::new("all", script))
    }

    /// Two-node record holding both connection strings.
    pub fn database_record(configurations: Vec<EtlConfiguration>) -> DatabaseRecord {
        let mut record = DatabaseRecord::new(DATABASE)
            .with_topology(DatabaseTopology::new([NODE, OTHER_NODE]))
            .with_connection_string(warehouse_connection())
            .with_connection_string(replica_connection());
        for configuration in configurations {
            record = record.with_configuration(configuration);
        }
        record
    }
}
