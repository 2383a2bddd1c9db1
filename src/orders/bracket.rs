//! Profit-target and stop-loss children placed when a parent order fills

use serde::{Deserialize, Serialize};

use super::order::{OcaType, Order, OrderSpec, TimeInForce};
use crate::types::{Instrument, RequestId};

/// Offsets recorded at placement, consumed on the parent's first fill.
/// The sign of either offset is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BracketOffsets {
    pub profit: f64,
    pub loss: f64,
}

impl BracketOffsets {
    pub fn new(profit: f64, loss: f64) -> Self {
        Self { profit, loss }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.profit == 0.0 && self.loss == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildRole {
    Profit,
    Loss,
}

/// Child ids recorded against a parent once its bracket is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BracketChildren {
    pub profit: Option<RequestId>,
    pub loss: Option<RequestId>,
}

/// A child order ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct BracketChild {
    pub request_id: RequestId,
    pub role: ChildRole,
    pub instrument: Instrument,
    pub spec: OrderSpec,
}

/// Children to place for one filled parent
#[derive(Debug, Clone, PartialEq)]
pub struct BracketPlacement {
    pub parent_id: RequestId,
    pub children: Vec<BracketChild>,
}

/// Child specs for a parent filled at `parent.avg_fill_price`.
///
/// Profit is a limit on the far side of the fill, loss a stop on the near
/// side. Both share one OCA group so that either filling cancels the other.
pub fn child_specs(parent: &Order, offsets: BracketOffsets) -> Vec<(ChildRole, OrderSpec)> {
    let direction = parent.action().direction();
    let action = parent.action().opposite();
    let quantity = parent.spec.quantity;
    let group = parent.bracket_group();
    let fill = parent.avg_fill_price;

    let mut children = Vec::with_capacity(2);
    if offsets.profit != 0.0 {
        let price = fill + offsets.profit.abs() * direction;
        children.push((
            ChildRole::Profit,
            OrderSpec::limit(action, quantity, price)
                .with_tif(TimeInForce::GoodTillCancelled)
                .with_oca(group.clone(), OcaType::CancelOnFill),
        ));
    }
    if offsets.loss != 0.0 {
        let price = fill - offsets.loss.abs() * direction;
        children.push((
            ChildRole::Loss,
            OrderSpec::stop(action, quantity, price)
                .with_tif(TimeInForce::GoodTillCancelled)
                .with_oca(group, OcaType::CancelOnFill),
        ));
    }
    children
}
