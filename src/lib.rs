pub mod admission;
pub mod config;
pub mod error;
pub mod generation;
pub mod hub;
pub mod input;
pub mod model;
pub mod precision;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{AdmissionController, AdmissionError, AdmissionReport};
pub use config::AppConfig;
pub use model::{ServiceContext, ServiceMetadata};
pub use server::build_router;
