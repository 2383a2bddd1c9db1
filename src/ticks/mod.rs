//! Live quote routing

mod router;

pub use router::{Subscribed, Tick, TickField, TickMessage, TickRouter, TickStream};
