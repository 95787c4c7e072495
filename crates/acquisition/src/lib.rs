//! TCP connection pool, per-endpoint circuit breaker, peer health
//! tracking, and the `ut_metadata` acquisition pipeline that turns
//! DHT/tracker-discovered peers into validated torrent metadata.

pub mod exchange;
pub mod health;
pub mod manager;
pub mod pool;

pub use exchange::{ExchangeError, MetadataBlob};
pub use health::{CircuitState, FailureReason, HealthTracker};
pub use manager::{AcquisitionConfig, AcquisitionManager};
pub use pool::{ConnectionPool, PoolError, PooledConnection, ReleaseOutcome};
