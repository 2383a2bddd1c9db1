//! Order ledger
//!
//! - `order`: order, execution and status types
//! - `bracket`: profit/loss children computed from a parent fill
//! - `ledger`: the store mutated by inbound order events

mod bracket;
mod ledger;
mod order;

pub use bracket::{child_specs, BracketChild, BracketChildren, BracketOffsets, BracketPlacement, ChildRole};
pub use ledger::{LedgerEffect, OpenOrderReport, OrderLedger, StatusUpdate};
pub use order::{Execution, OcaType, Order, OrderKind, OrderSpec, OrderStatus, TimeInForce};
