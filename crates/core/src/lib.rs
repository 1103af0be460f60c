pub mod alerts;
pub mod cluster;
pub mod config;
pub mod destination;
pub mod engine;
pub mod item;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod resources;
pub mod state;
pub mod stats;
pub mod storage;
pub mod task;
pub mod testing;
pub mod transform;

mod sync;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, EtlSettings,
    LogFormat, LoggingConfig, NodeConfig,
};
pub use engine::{
    EngineContext, EngineError, EngineProgress, EngineState, IterationOutcome, PipelineEngine,
    TestScriptInput, TestScriptResult,
};
pub use logging::{init_logging, LoggingError};
pub use registry::{PipelineRegistry, RegistryContext, RegistryError};
pub use task::{
    CollectionFilter, ConnectionString, DatabaseRecord, DatabaseTopology, DestinationKind,
    EtlConfiguration, ResolvedConfiguration, Transformation,
};
