pub mod config;
pub mod download_manager;
pub mod library;
pub mod matching;
pub mod upstream;
