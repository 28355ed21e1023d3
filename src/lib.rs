pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
