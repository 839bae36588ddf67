//! Per-request weighted balancing. A balancer owns the request's weight
//! map; nothing it mutates outlives the request.

mod breaker;
mod lottery;
mod rotor;

use std::collections::BTreeMap;

pub use breaker::Breaker;
pub use lottery::Lottery;
pub use rotor::Rotor;

pub const STRATEGY_LOTTERY: &str = "lottery";
pub const STRATEGY_ROTOR: &str = "rotor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no candidate with positive weight")]
pub struct NoCandidates;

pub trait Balancer: Send {
    /// Select a candidate id, or fail when no positive-weight candidate
    /// remains. An empty result is terminal for the request.
    fn pick(&mut self) -> Result<i64, NoCandidates>;
    /// Soft failure: downgrade the candidate but keep it selectable.
    fn reduce(&mut self, id: i64);
    /// Hard failure: remove the candidate from future selection.
    fn delete(&mut self, id: i64);
    /// Reward hook; strategies may treat it as a no-op.
    fn success(&mut self, id: i64);
}

/// Build the balancer for a model's strategy tag, wrapping it in the
/// circuit breaker when the model asks for one. Unknown tags fall back to
/// the lottery.
pub fn for_strategy(
    strategy: &str,
    weights: BTreeMap<i64, u32>,
    breaker: bool,
) -> Box<dyn Balancer> {
    let inner: Box<dyn Balancer> = match strategy {
        STRATEGY_ROTOR => Box::new(Rotor::new(weights)),
        _ => Box::new(Lottery::new(weights)),
    };
    if breaker {
        Box::new(Breaker::new(inner))
    } else {
        inner
    }
}

/// Shared reduce rule: halve, flooring at 1 for weights that were at least
/// 2; a weight of 1 drops to 0 and leaves the candidate unselectable.
fn reduce_weight(weight: u32) -> u32 {
    if weight >= 2 { (weight / 2).max(1) } else { 0 }
}
