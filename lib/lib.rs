pub mod build_info;
pub mod cli;
pub mod config;
pub mod db;
pub mod logging;
pub mod plan;
pub mod server;
pub mod state;
pub mod stores;
pub mod sync_service;
pub mod tag_filter;
