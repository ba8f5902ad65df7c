//! Execution-algorithm runtime: child-order planners sharing a common
//! lifecycle and fill-correlation contract, plus the router that picks
//! among them and the simulator the backtest engine drives.

pub mod base;
pub mod contracts;
pub mod iceberg;
pub mod pov;
pub mod router;
pub mod simulator;
pub mod slippage;
pub mod twap;
pub mod vwap;

pub use base::{generate_execution_id, Executor, FillTracker};
pub use contracts::{
    summarize_fills, AlgoType, ExecutionAlgorithm, ExecutionIntent, ExecutionReport,
    ExecutionStatus, FillEvent, OrderType, Side,
};
pub use iceberg::IcebergExecutor;
pub use pov::PovExecutor;
pub use router::SmartOrderRouter;
pub use twap::TwapExecutor;
pub use vwap::VwapExecutor;
