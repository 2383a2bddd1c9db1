//! Historical data retrieval
//!
//! A range is planned into bounded windows up front ([`plan_windows`]), then
//! issued one at a time through a shared [`PacingGate`] by a [`HistoryPlan`].

mod pacer;
mod plan;

pub use pacer::{Bar, BarCollector, BarSource, HistoryBlock, HistoryPlan, PacingGate, PlanCancel};
pub use plan::{parse_civil, parse_timezone, plan_windows, HistoricalRequest, HistoryWindow};
