pub mod balance;
pub mod service;

pub use balance::{BalanceSource, HttpBalanceSource};
pub use service::DriftService;
