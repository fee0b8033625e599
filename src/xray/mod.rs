pub mod config_file;
pub mod outbound;
pub mod restart;
