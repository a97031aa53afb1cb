pub mod processor;
pub mod proxy;
pub mod remote;
pub mod runtime;
pub mod source;
pub mod worker;

pub use processor::scheduler::BatchScheduler;
pub use processor::worker_pool::{ExitReason, WorkerPool, WorkerPoolParams};
pub use proxy::{load_proxies, ProxyRotator};
pub use remote::{
    AccountService, AccountServiceFactory, HttpAccountService, HttpAccountServiceFactory,
    HttpServiceOptions, PointsSnapshot, RemoteStep,
};
pub use runtime::config::{EngineConfig, EngineConfigBuilder, EngineConfigParams};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::progress::{PassEnd, PassStats, PassSummary};
pub use runtime::runner::{RunExit, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use source::{
    Account, AccountSource, Credential, DataSourceError, DatabaseConfig, MySqlAccountSource,
    RetryPolicy,
};
pub use worker::{ErrorKind, Liveness, Outcome, Task, TaskError, TaskReport, WorkerState};
