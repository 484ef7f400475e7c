pub mod config;
pub mod db;
pub mod drift;
pub mod error;
pub mod jobs;
pub mod matcher;
pub mod reconcile;
pub mod risk;
pub mod types;
