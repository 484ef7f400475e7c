pub mod scoring;
pub mod service;

pub use scoring::assess;
pub use service::RiskService;
