pub mod chunk_plan;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod journal;
pub mod metadata;
pub mod orchestrator;
pub mod postprocess;
pub mod progress;
pub mod recovery;
pub mod report;
pub mod throttle;
pub mod util;
