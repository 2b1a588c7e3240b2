//! Reinforcement state machine.
//!
//! A damaged node with charges left enters a wall-clock protected window
//! during which it cannot be killed. When the window ends the node returns to
//! Normal if it still has charges, otherwise it becomes Vulnerable for a
//! short, PvP-exposed window.
//!
//! End times are absolute wall-clock instants. They are persisted and resumed
//! as-is after a restart; nothing here recomputes them from elapsed ticks.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::start_of_day;
use crate::fixed::Fixed64;
use crate::tuning::Tuning;

/// The reinforcement phase. Each timed phase carries its own end time, so a
/// node can never hold a stale end time of another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReinforcePhase {
    Normal,
    Reinforced { end: DateTime<Utc> },
    Vulnerable { end: DateTime<Utc> },
}

/// Persistable reinforcement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReinforceSnapshot {
    pub phase: ReinforcePhase,
    pub counter: u32,
    pub next_counter_increase: DateTime<Utc>,
    pub offset_hour: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReinforceParams {
    pub armor_threshold: Fixed64,
    pub counter_increase: TimeDelta,
    pub reinforce_length: TimeDelta,
    pub vulnerable_length: TimeDelta,
    pub check_interval: Duration,
}

impl ReinforceParams {
    pub fn from_tuning(tuning: &Tuning) -> Self {
        Self {
            armor_threshold: tuning.reinforce_armor_threshold(),
            counter_increase: tuning.counter_increase_interval(),
            reinforce_length: tuning.reinforce_length(),
            vulnerable_length: tuning.vulnerable_length(),
            check_interval: tuning.reinforce_check_interval(),
        }
    }
}

/// Node conditions consulted on damage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReinforceGate {
    pub armor_ratio: Fixed64,
    pub reinforceable: bool,
    pub fully_constructed: bool,
    pub orphaned: bool,
}

/// A phase change (or counter change) the engine must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinforceTransition {
    Started { end: DateTime<Utc>, adopted: bool },
    Ended,
    VulnerableStarted { end: DateTime<Utc> },
    VulnerableEnded,
    CounterIncreased { counter: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reinforcement {
    phase: ReinforcePhase,
    counter: u32,
    counter_max: u32,
    next_counter_increase: DateTime<Utc>,
    offset_hour: u8,
    check_timer: Duration,
}

impl Reinforcement {
    /// A freshly deployed node: Normal, all charges available.
    pub fn new(counter_max: u32, now: DateTime<Utc>, params: &ReinforceParams) -> Self {
        Self {
            phase: ReinforcePhase::Normal,
            counter: counter_max,
            counter_max,
            next_counter_increase: now + params.counter_increase,
            offset_hour: 0,
            check_timer: params.check_interval,
        }
    }

    /// Resume from persisted state. Timed phases keep their stored end.
    pub fn restore(snapshot: ReinforceSnapshot, counter_max: u32) -> Self {
        Self {
            phase: snapshot.phase,
            counter: snapshot.counter.min(counter_max),
            counter_max,
            next_counter_increase: snapshot.next_counter_increase,
            offset_hour: snapshot.offset_hour.min(23),
            check_timer: Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> ReinforceSnapshot {
        ReinforceSnapshot {
            phase: self.phase,
            counter: self.counter,
            next_counter_increase: self.next_counter_increase,
            offset_hour: self.offset_hour,
        }
    }

    pub fn phase(&self) -> ReinforcePhase {
        self.phase
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn counter_max(&self) -> u32 {
        self.counter_max
    }

    pub fn next_counter_increase(&self) -> DateTime<Utc> {
        self.next_counter_increase
    }

    pub fn offset_hour(&self) -> u8 {
        self.offset_hour
    }

    pub fn is_reinforced(&self) -> bool {
        matches!(self.phase, ReinforcePhase::Reinforced { .. })
    }

    pub fn is_vulnerable(&self) -> bool {
        matches!(self.phase, ReinforcePhase::Vulnerable { .. })
    }

    pub fn reinforce_end(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            ReinforcePhase::Reinforced { end } => Some(end),
            _ => None,
        }
    }

    pub fn vulnerable_end(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            ReinforcePhase::Vulnerable { end } => Some(end),
            _ => None,
        }
    }

    pub fn can_be_killed(&self) -> bool {
        match self.phase {
            ReinforcePhase::Normal => true,
            ReinforcePhase::Reinforced { .. } => false,
            ReinforcePhase::Vulnerable { .. } => true,
        }
    }

    /// Caller validates the hour range.
    pub fn set_offset_hour(&mut self, hour: u8) {
        self.offset_hour = hour;
    }

    /// Whether damage that left the node in `gate` should start reinforcement.
    pub fn should_enter(&self, gate: &ReinforceGate, params: &ReinforceParams) -> bool {
        self.phase == ReinforcePhase::Normal
            && self.counter > 0
            && gate.reinforceable
            && gate.fully_constructed
            && !gate.orphaned
            && gate.armor_ratio < params.armor_threshold
    }

    /// Enter Reinforced, consuming one charge.
    ///
    /// `adopted` is the end time of another reinforced node in the same
    /// network; without one a fresh end is computed from the offset hour.
    pub fn enter(
        &mut self,
        now: DateTime<Utc>,
        adopted: Option<DateTime<Utc>>,
        params: &ReinforceParams,
    ) -> ReinforceTransition {
        self.counter = self.counter.saturating_sub(1);
        let end = adopted
            .unwrap_or_else(|| compute_reinforce_end(now, params.reinforce_length, self.offset_hour));
        self.phase = ReinforcePhase::Reinforced { end };
        ReinforceTransition::Started {
            end,
            adopted: adopted.is_some(),
        }
    }

    /// Leave Reinforced immediately (the node lost its base).
    pub fn cancel(&mut self) -> bool {
        if self.is_reinforced() {
            self.phase = ReinforcePhase::Normal;
            true
        } else {
            false
        }
    }

    /// Periodic check, evaluated once per `check_interval` of simulated time.
    pub fn update(
        &mut self,
        dt: Duration,
        now: DateTime<Utc>,
        params: &ReinforceParams,
    ) -> Option<ReinforceTransition> {
        self.check_timer = self.check_timer.saturating_sub(dt);
        if !self.check_timer.is_zero() {
            return None;
        }
        self.check_timer = params.check_interval;

        match self.phase {
            ReinforcePhase::Normal => {
                if now < self.next_counter_increase {
                    return None;
                }
                self.next_counter_increase = now + params.counter_increase;
                if self.counter < self.counter_max {
                    self.counter += 1;
                    Some(ReinforceTransition::CounterIncreased {
                        counter: self.counter,
                    })
                } else {
                    None
                }
            }
            ReinforcePhase::Reinforced { end } => {
                if now < end {
                    return None;
                }
                if self.counter > 0 {
                    self.phase = ReinforcePhase::Normal;
                    Some(ReinforceTransition::Ended)
                } else {
                    let end = now + params.vulnerable_length;
                    self.phase = ReinforcePhase::Vulnerable { end };
                    self.next_counter_increase = now + params.counter_increase;
                    Some(ReinforceTransition::VulnerableStarted { end })
                }
            }
            ReinforcePhase::Vulnerable { end } => {
                if now < end {
                    return None;
                }
                self.phase = ReinforcePhase::Normal;
                Some(ReinforceTransition::VulnerableEnded)
            }
        }
    }
}

/// End of a fresh reinforcement window: midnight of `now`'s day plus the
/// reinforce length plus the owner's offset hour, moved forward a day at a
/// time until it lies in the future.
pub fn compute_reinforce_end(now: DateTime<Utc>, length: TimeDelta, offset_hour: u8) -> DateTime<Utc> {
    let mut end = start_of_day(now) + length + TimeDelta::hours(i64::from(offset_hour));
    while end <= now {
        end += TimeDelta::days(1);
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    fn params() -> ReinforceParams {
        ReinforceParams::from_tuning(&Tuning::default())
    }

    fn gate(armor_ratio: f64) -> ReinforceGate {
        ReinforceGate {
            armor_ratio: Fixed64::from_num(armor_ratio),
            reinforceable: true,
            fully_constructed: true,
            orphaned: false,
        }
    }

    fn tick(r: &mut Reinforcement, now: DateTime<Utc>) -> Option<ReinforceTransition> {
        r.update(params().check_interval, now, &params())
    }

    #[test]
    fn end_is_next_day_at_offset() {
        let end = compute_reinforce_end(at(15, 30), TimeDelta::minutes(1440), 0);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());

        let end = compute_reinforce_end(at(15, 30), TimeDelta::minutes(1440), 18);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 11, 18, 0, 0).unwrap());
    }

    #[test]
    fn end_rolls_forward_until_future() {
        let end = compute_reinforce_end(at(20, 0), TimeDelta::minutes(60), 2);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 11, 3, 0, 0).unwrap());
        let end = compute_reinforce_end(at(1, 0), TimeDelta::minutes(60), 2);
        assert_eq!(end, at(3, 0));
    }

    #[test]
    fn damage_below_threshold_enters() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        assert!(!r.should_enter(&gate(0.6), &params()));
        assert!(r.should_enter(&gate(0.4), &params()));

        let t = r.enter(at(12, 0), None, &params());
        assert!(matches!(t, ReinforceTransition::Started { adopted: false, .. }));
        assert!(r.is_reinforced());
        assert_eq!(r.counter(), 2);
        assert!(!r.can_be_killed());
    }

    #[test]
    fn no_entry_without_charges() {
        let mut r = Reinforcement::new(1, at(12, 0), &params());
        r.enter(at(12, 0), None, &params());
        r.cancel();
        assert_eq!(r.counter(), 0);
        assert!(!r.should_enter(&gate(0.1), &params()));
    }

    #[test]
    fn no_entry_when_orphaned_or_unbuilt() {
        let r = Reinforcement::new(3, at(12, 0), &params());
        let mut g = gate(0.1);
        g.orphaned = true;
        assert!(!r.should_enter(&g, &params()));
        let mut g = gate(0.1);
        g.fully_constructed = false;
        assert!(!r.should_enter(&g, &params()));
    }

    #[test]
    fn adopted_end_is_used_verbatim() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        let adopted = at(23, 17);
        let t = r.enter(at(12, 0), Some(adopted), &params());
        assert_eq!(t, ReinforceTransition::Started { end: adopted, adopted: true });
        assert_eq!(r.reinforce_end(), Some(adopted));
    }

    #[test]
    fn expiry_with_charges_returns_to_normal() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        r.enter(at(12, 0), Some(at(13, 0)), &params());
        assert_eq!(tick(&mut r, at(12, 59)), None);
        assert_eq!(tick(&mut r, at(13, 0)), Some(ReinforceTransition::Ended));
        assert_eq!(r.phase(), ReinforcePhase::Normal);
    }

    #[test]
    fn expiry_without_charges_turns_vulnerable() {
        let mut r = Reinforcement::new(1, at(12, 0), &params());
        r.enter(at(12, 0), Some(at(13, 0)), &params());
        let t = tick(&mut r, at(13, 0));
        assert_eq!(t, Some(ReinforceTransition::VulnerableStarted { end: at(15, 0) }));
        assert!(r.can_be_killed());
        assert_eq!(r.next_counter_increase(), at(13, 0) + TimeDelta::minutes(2880));

        assert_eq!(tick(&mut r, at(14, 59)), None);
        assert_eq!(tick(&mut r, at(15, 0)), Some(ReinforceTransition::VulnerableEnded));
        assert_eq!(r.phase(), ReinforcePhase::Normal);
    }

    #[test]
    fn counter_regenerates_up_to_max() {
        let mut r = Reinforcement::new(2, at(12, 0), &params());
        r.enter(at(12, 0), Some(at(12, 5)), &params());
        tick(&mut r, at(12, 5));
        assert_eq!(r.counter(), 1);

        let later = at(12, 0) + TimeDelta::minutes(2880);
        assert_eq!(
            tick(&mut r, later),
            Some(ReinforceTransition::CounterIncreased { counter: 2 })
        );
        let much_later = later + TimeDelta::minutes(2880);
        assert_eq!(tick(&mut r, much_later), None);
        assert_eq!(r.counter(), 2);
    }

    #[test]
    fn checks_run_on_cadence_only() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        r.enter(at(12, 0), Some(at(12, 1)), &params());
        // first check consumes the initial timer
        assert_eq!(r.update(Duration::from_secs(10), at(12, 2), &params()), Some(ReinforceTransition::Ended));

        r.enter(at(12, 2), Some(at(12, 3)), &params());
        assert_eq!(r.update(Duration::from_secs(4), at(12, 4), &params()), None);
        assert_eq!(r.update(Duration::from_secs(6), at(12, 4), &params()), Some(ReinforceTransition::Ended));
    }

    #[test]
    fn orphan_cancel_only_affects_reinforced() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        assert!(!r.cancel());
        r.enter(at(12, 0), None, &params());
        assert!(r.cancel());
        assert_eq!(r.phase(), ReinforcePhase::Normal);
    }

    #[test]
    fn restore_keeps_end_and_counter() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        r.set_offset_hour(5);
        r.enter(at(12, 0), None, &params());
        let snap = r.snapshot();

        let resumed = Reinforcement::restore(snap, 3);
        assert_eq!(resumed.reinforce_end(), r.reinforce_end());
        assert_eq!(resumed.counter(), 2);
        assert_eq!(resumed.offset_hour(), 5);
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let mut r = Reinforcement::new(3, at(12, 0), &params());
        r.enter(at(12, 0), None, &params());
        let json = serde_json::to_string(&r.snapshot()).unwrap();
        let back: ReinforceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r.snapshot());
    }
}
