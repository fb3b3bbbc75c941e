pub mod config;
pub mod errors;
pub mod logging;
pub mod manifest;
pub mod persist;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod state;
