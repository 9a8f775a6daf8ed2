pub mod config;
pub mod ipc;
pub mod path_detector;
pub mod process_monitor;
pub mod supervisor;
pub mod utils;
