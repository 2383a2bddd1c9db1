// Library crate - correlation and lifecycle core for a trading gateway connection

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod history;
pub mod orders;
pub mod ticks;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::{Account, Client, Holding, Reply};
pub use config::{ClientConfig, HistorySettings};
pub use error::{ClientError, Result};
pub use history::{Bar, HistoryBlock, HistoryPlan};
pub use orders::{Order, OrderKind, OrderSpec, OrderStatus, TimeInForce};
pub use ticks::{Tick, TickStream};
pub use transport::{ChannelTransport, InboundEvent, SimulatedTransport, Transport, WireCommand};
pub use types::*;
