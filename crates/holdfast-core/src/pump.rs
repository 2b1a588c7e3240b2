//! Core pump: weighted distribution of stored core energy along out-edges.
//!
//! Each pumping node pushes at most its nominal `core_transferred` per tick,
//! split across eligible out-connections in proportion to their weight.
//! Heavier connections are served first and the source stops as soon as its
//! store falls to the pump minimum. Targets receive the drawn amount scaled
//! by the source's transfer efficiency; transfers whose effective amount is
//! not above the minimum are skipped and nothing is drawn for them.
//!
//! The source never draws more than `core_transferred` in one step, and no
//! target is offered more than its free capacity, however many candidates
//! point at it.

use crate::fixed::Fixed64;
use crate::id::*;
use crate::node::Gauge;
use crate::tuning::Tuning;

/// Thresholds shared by every pump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpParams {
    pub pump_minimum: Fixed64,
    pub min_transfer: Fixed64,
}

impl PumpParams {
    pub fn from_tuning(tuning: &Tuning) -> Self {
        Self {
            pump_minimum: tuning.pump_minimum(),
            min_transfer: tuning.min_transfer(),
        }
    }
}

/// An out-connection whose target can currently take energy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpCandidate {
    pub connection: ConnectionId,
    pub target: NodeId,
    pub weight: Fixed64,
    /// Free capacity of the target.
    pub need: Fixed64,
}

/// One successful transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub connection: ConnectionId,
    pub target: NodeId,
    /// Drawn from the source.
    pub raw: Fixed64,
    /// Added to the target.
    pub effective: Fixed64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpOutcome {
    pub transfers: Vec<Transfer>,
    /// Total drawn from the source; becomes its `last_used_core`.
    pub drawn: Fixed64,
}

/// Run one pump step for a source node.
///
/// Mutates `source` only; the caller credits each [`Transfer::effective`] to
/// its target. Candidates with zero weight or no free capacity are ignored.
pub fn distribute(
    source: &mut Gauge,
    core_transferred: Fixed64,
    efficiency: Fixed64,
    candidates: &[PumpCandidate],
    params: &PumpParams,
) -> PumpOutcome {
    let mut outcome = PumpOutcome::default();
    if source.current() < params.pump_minimum {
        return outcome;
    }

    let mut eligible: Vec<PumpCandidate> = candidates
        .iter()
        .filter(|c| c.weight > Fixed64::ZERO && c.need > Fixed64::ZERO)
        .copied()
        .collect();
    if eligible.is_empty() {
        return outcome;
    }
    eligible.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.connection.cmp(&b.connection))
    });

    let weight_sum = eligible
        .iter()
        .fold(Fixed64::ZERO, |sum, c| sum.saturating_add(c.weight));
    // Capacity already promised per target this step.
    let mut promised: Vec<(NodeId, Fixed64)> = Vec::new();

    for candidate in &eligible {
        if source.current() <= params.pump_minimum {
            break;
        }
        let budget = core_transferred.saturating_sub(outcome.drawn);
        if budget <= Fixed64::ZERO {
            break;
        }
        let already = promised
            .iter()
            .find(|(target, _)| *target == candidate.target)
            .map_or(Fixed64::ZERO, |(_, amount)| *amount);
        let need = candidate.need.saturating_sub(already);
        let share = candidate
            .weight
            .checked_div(weight_sum)
            .map(|fraction| fraction.saturating_mul(core_transferred))
            .unwrap_or(Fixed64::ZERO);
        let raw = need.min(share).min(budget).min(source.current());
        let effective = raw.saturating_mul(efficiency);
        if effective <= params.min_transfer {
            continue;
        }
        source.take(raw);
        outcome.drawn += raw;
        match promised.iter_mut().find(|(target, _)| *target == candidate.target) {
            Some((_, amount)) => *amount += effective,
            None => promised.push((candidate.target, effective)),
        }
        outcome.transfers.push(Transfer {
            connection: candidate.connection,
            target: candidate.target,
            raw,
            effective,
        });
    }

    outcome
}
