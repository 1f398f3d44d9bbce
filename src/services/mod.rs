//! Service layer for langcheck

pub mod config;
pub mod validation;

pub use config::{ConfigService, DefaultConfigService};
pub use validation::{ValidationService, Validator};
