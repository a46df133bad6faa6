//! Core, I/O-free abstractions shared by the auditr agent: route
//! classification, field extraction, event assembly, and configuration
//! parsing. Everything here is synchronous and allocation-only — the
//! networking, filesystem watching, and worker-pool machinery built on top
//! of it live in `auditr-services`.

#[macro_use]
mod error;
pub use error::{AnyError, AnyResult, BuildError, ConfigError, ExtractError, RouteError};

pub mod config;
pub mod configurer;
pub mod envelope;
pub mod event;
pub mod extractor;
pub mod route;
pub mod util;

pub use config::Configuration;
pub use configurer::Configurer;
