#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../shared/retry.rs"]
pub mod shared_retry;

pub mod shared {
    pub use super::shared_retry as retry;
}

pub mod assist;
pub mod catalog;
pub mod config;
pub mod consensus;
pub mod curate;
pub mod export;
pub mod genotype;
pub mod memory;
pub mod orchestrate;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod proxy;
pub mod resolve;
pub mod stats;
pub mod types;
