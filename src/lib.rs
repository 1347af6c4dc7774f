pub mod assembler;
pub mod config;
pub mod fetch;
pub mod metadata;
pub mod monitor;
pub mod primitives;
pub mod verify;

pub use config::{
    Config,
    MonitorConfig,
};
pub use monitor::Monitor;

#[cfg(any(test, feature = "test"))]
pub mod test_utils;
