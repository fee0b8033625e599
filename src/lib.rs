pub mod config;
pub mod descriptor;
pub mod domain;
pub mod endpoint_probe;
pub mod fs_atomic;
pub mod manager;
pub mod state;
pub mod subscription;
pub mod switcher;
pub mod version;
pub mod xray;
