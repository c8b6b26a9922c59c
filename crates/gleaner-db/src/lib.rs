pub mod config;
pub mod database;
pub mod history_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use history_repository::HistoryRepository;
