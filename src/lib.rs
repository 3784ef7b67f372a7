// src/lib.rs
pub mod tuner {
    pub use crate::types::{Options, TuningDelay};

    /// Async entry-point; returns once every run target is stored and reported
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        crate::core::run(opts).await
    }
}

pub mod config;
pub mod constants;
pub mod engine;
pub mod inspector;
pub mod network;
pub mod playlist;
pub mod probe;
pub mod profiles;
pub mod report;
pub mod stats;
pub mod store;
pub mod tailer;
pub mod types;

mod core;
