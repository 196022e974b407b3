pub mod access;
pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod pricing;
pub mod scheduler;

pub use access::{AccessDirectory, AccessError, HttpAccessDirectory, MockAccessDirectory};
pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    Actor, Direction, DurationUnit, Money, PositionStatus, Role, TimeMs, TradePosition,
};
pub use engine::{ModificationPipeline, SettlementPipeline};
pub use error::AppError;
pub use pricing::{
    BinancePriceProvider, MockPriceProvider, PriceProvider, PriceResolver, SimulatedPriceProvider,
};
pub use scheduler::AutoCloseScheduler;
