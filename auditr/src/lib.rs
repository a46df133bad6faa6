//! In-process audit-event agent: classifies HTTP requests against
//! operator-configured routes and ships structured audit events to a
//! remote collector in batches.
//!
//! The public surface is small: construct an [`Agent`] (via
//! [`Agent::from_env`] or [`Agent::new`]), install [`Agent::layer`] into
//! the host's `tower`-based handler stack, and drain the response channel
//! [`Agent::new`] hands back however the host logs/monitors things it
//! already owns.

pub mod agent;
pub mod middleware;

pub use agent::{Agent, AgentConfig};
pub use middleware::{AuditLayer, AuditService, ResourceTemplateFn};

pub use auditr_core::route::{Route, RouteType};
pub use auditr_services::Response;
