//! 调度器模块

pub mod scan_controller;

pub use scan_controller::{ScanController, ScanControllerStatus, ScanRun, ScanState};
