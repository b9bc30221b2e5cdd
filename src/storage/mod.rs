pub mod database;
pub mod message_store;

pub use message_store::MessageStore;

use std::fs;

/// Ensure data directory exists
pub fn ensure_data_dir() -> std::io::Result<()> {
    fs::create_dir_all("data")
}
