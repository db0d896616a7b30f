pub mod cluster;
pub mod container;
pub mod errors;
pub mod garbage_collector;
pub mod names;
pub mod operator;
pub mod pod;
pub mod rbac;
pub mod secrets;
pub mod state;

pub use cluster::{ClusterClient, KubeCluster};
#[cfg(any(test, feature = "test-util"))]
pub use cluster::MemoryCluster;
pub use container::ContainerDeployer;
pub use errors::{DeployerError, ErrorCode};
pub use garbage_collector::{GarbageCollector, SweepReport};
pub use operator::start_operator;
pub use state::State;
