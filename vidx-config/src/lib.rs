//! Configuration for the vidx pipeline: file and environment loading,
//! tracing setup and wiring of the core components from a single
//! [`VidxConfig`].

mod loader;
mod models;
pub mod pipeline;
pub mod telemetry;

pub use loader::{CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigSource};
pub use models::*;
pub use pipeline::Pipeline;
