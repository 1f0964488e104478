// asirikuy_core/src/lib.rs

pub mod error;
pub mod utils;
pub mod rates;
pub mod native;
pub mod orders;
pub mod report;
pub mod context;
pub mod settings;
pub mod scripted;
pub mod instances;
pub mod execution;
pub mod portfolio;
pub mod statistics;
pub mod optimization;
pub mod engine_loader;
