// Health probes across every tenant database plus process resources

pub mod aggregator;
pub mod resources;

pub use aggregator::{HealthAggregator, HealthConfig};
pub use resources::{ResourceError, ResourceProbe};
