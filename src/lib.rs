//! Restores files from a backup whose contents are split into encrypted
//! chunks, packed into containers spread over several storage hosts.
//!
//! The [`downloader::SignatureDownloader`] fetches containers in rounds of
//! concurrent workers and hands every payload to the
//! [`manager::StoreManager`], which decrypts it and writes each file the
//! moment its last chunk arrived.

pub mod config;
pub mod decrypt;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod model;
pub mod plans;
pub mod progress;
pub mod reader;
pub mod refs;
pub mod store;
pub mod synthetic;
pub mod tally;
pub mod transport;
pub mod writer;

pub use config::EngineConfig;
pub use downloader::{DownloadReport, SignatureDownloader};
pub use error::{Fatal, UnitFailure};
pub use manager::StoreManager;
pub use tally::Tally;
