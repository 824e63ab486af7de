pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics_consts;
pub mod normalizer;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod sinks;
pub mod source;
pub mod stores;
pub mod watermark;
