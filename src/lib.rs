pub mod config;
pub mod context;
pub mod core;
pub mod format;
pub mod logging;
pub mod remote;
