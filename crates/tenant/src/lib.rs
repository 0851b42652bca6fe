// Tenant routing: per-task routing context, pool resolution and runtime onboarding

pub mod context;
pub mod error;
pub mod extractor;
pub mod onboarding;
pub mod router;

pub use context::{RoutingContext, RoutingGuard};
pub use error::{Result, RoutingError, TenantError};
pub use extractor::{TenantSelector, TENANT_HEADER, TENANT_QUERY_PARAM};
pub use onboarding::{OnboardingOutcome, TenantOnboarder};
pub use router::{FallbackReason, RouteDecision, Routed, TenantRouter};
