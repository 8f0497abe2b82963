// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Merging of admitted streams into a single gate-control list
//!
//! The [`Scheduler`] holds the scheduled traffics admitted on one interface.
//! [`Scheduler::admit`] is pure: it returns the successor scheduler together
//! with the merged [`Schedule`] and leaves `self` untouched, so the caller
//! can apply the system configuration first and only then commit the new
//! state. A failed admission is rolled back by dropping the returned value.
//!
//! ```
//! use detd::scheduler::{Scheduler, Traffic};
//!
//! let scheduler = Scheduler::default();
//! let traffic = Traffic::new(1, 2_000_000, 250_000, 12_176);
//! let (scheduler, schedule) = scheduler.admit(traffic)?;
//! assert_eq!(schedule.cycle_ns, 2_000_000);
//! assert_eq!(scheduler.traffics().len(), 1);
//! # Ok::<(), detd::error::AdmissionError>(())
//! ```

use crate::error::AdmissionError;
use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};
use num_derive::{FromPrimitive, ToPrimitive};

/// Traffic class reserved for best-effort traffic
pub const BEST_EFFORT_TC: u8 = 0;

const NS_PER_S: u64 = 1_000_000_000;

/// How many cycles of lead time the kernel gets before the schedule starts
const BASE_TIME_LEAD_CYCLES: u64 = 2;

/// One admitted scheduled stream, bound to its traffic class
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Traffic {
    /// Traffic class whose gate opens for this stream
    pub tc: u8,

    /// Stream period in nanoseconds
    pub interval_ns: u64,

    /// Transmission offset within the period
    pub offset_ns: u64,

    /// Wire time of one frame
    pub duration_ns: u64,
}

impl Traffic {
    /// Bind a stream's timing to a traffic class
    #[must_use]
    pub const fn new(tc: u8, interval_ns: u64, offset_ns: u64, duration_ns: u64) -> Self {
        Self {
            tc,
            interval_ns,
            offset_ns,
            duration_ns,
        }
    }
}

/// A half-open time slot `[start_ns, end_ns)` owned by one traffic class
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Slot {
    /// Slot start relative to cycle start
    pub start_ns: u64,

    /// Slot end relative to cycle start
    pub end_ns: u64,

    /// Traffic class whose gate is open during the slot
    pub tc: u8,
}

impl Slot {
    const fn length_ns(&self) -> u64 {
        self.end_ns - self.start_ns
    }
}

/// Gate operation of a control list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum GateOperation {
    /// Set the gate states for the interval
    SetGates = 0,

    /// Set and hold preemption
    SetAndHold = 1,

    /// Set and release preemption
    SetAndRelease = 2,
}

impl GateOperation {
    /// One-letter form used by `tc qdisc ... sched-entry`
    #[must_use]
    pub const fn symbol(self) -> char {
        match self {
            Self::SetGates => 'S',
            Self::SetAndHold => 'H',
            Self::SetAndRelease => 'R',
        }
    }
}

/// One entry of the taprio gate-control list
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct GateControlEntry {
    /// Gate operation
    pub operation: GateOperation,

    /// Interval the gate states stay active
    pub time_interval_value_ns: u64,

    /// Bitmap over traffic classes, bit i open = TC i may transmit
    pub gate_states_value: u16,
}

impl GateControlEntry {
    /// Gate states as the hex string `tc` expects
    #[must_use]
    pub fn gate_states_hex(&self) -> String {
        format!("{:02X}", self.gate_states_value)
    }
}

/// The merged transmission plan of one interface
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Schedule {
    /// Cycle length, the least common multiple of all admitted periods
    pub cycle_ns: u64,

    /// Slots ordered by start time, covering the full cycle
    slots: Vec<Slot>,
}

impl Schedule {
    /// Slots ordered by start time, best-effort padding included
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Number of traffic classes the schedule references
    #[must_use]
    pub fn num_traffic_classes(&self) -> u8 {
        self.slots.iter().map(|s| s.tc).max().unwrap_or(0) + 1
    }

    /// Render the schedule as a taprio gate-control list
    #[must_use]
    pub fn gate_control_list(&self) -> Vec<GateControlEntry> {
        self.slots
            .iter()
            .map(|slot| GateControlEntry {
                operation: GateOperation::SetGates,
                time_interval_value_ns: slot.length_ns(),
                gate_states_value: 1 << slot.tc,
            })
            .collect()
    }

    /// True if any gate has to open more than once over the cycle
    ///
    /// Some controllers (e.g. i210, i225) refuse such schedules.
    #[must_use]
    pub fn opens_gate_multiple_times_per_cycle(&self) -> bool {
        let mut opened: Vec<u8> = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            if opened.contains(&slot.tc) {
                // The gate simply stays open over adjacent slots
                let stays_open = i > 0 && self.slots[i - 1].tc == slot.tc;
                if !stays_open {
                    return true;
                }
            } else {
                opened.push(slot.tc);
            }
        }

        false
    }
}

/// The set of scheduled streams admitted on one interface
#[derive(Debug, Default, Clone)]
pub struct Scheduler {
    traffics: Vec<Traffic>,
}

impl Scheduler {
    /// The admitted scheduled traffics
    #[must_use]
    pub fn traffics(&self) -> &[Traffic] {
        &self.traffics
    }

    /// Merge a new traffic into the schedule
    ///
    /// Returns the successor scheduler and the merged schedule without
    /// modifying `self`; the caller commits by replacing its scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::ScheduleConflict`] if any transmission slot
    /// of the new traffic overlaps a slot of an admitted one over the merged
    /// cycle, and [`AdmissionError::Validation`] if a slot does not fit
    /// within its own period.
    pub fn admit(&self, traffic: Traffic) -> Result<(Self, Schedule), AdmissionError> {
        let mut traffics = self.traffics.clone();
        traffics.push(traffic);

        let schedule = build_schedule(&traffics)?;

        Ok((Self { traffics }, schedule))
    }
}

fn build_schedule(traffics: &[Traffic]) -> Result<Schedule, AdmissionError> {
    let cycle_ns = traffics
        .iter()
        .map(|t| t.interval_ns)
        .fold(1, |acc, interval| lcm(acc, interval));

    let mut scheduled: Vec<Slot> = Vec::new();
    for traffic in traffics {
        if traffic.offset_ns + traffic.duration_ns > traffic.interval_ns {
            return Err(AdmissionError::Validation(format!(
                "slot [{}, {}) does not fit within the period of {} ns",
                traffic.offset_ns,
                traffic.offset_ns + traffic.duration_ns,
                traffic.interval_ns
            )));
        }

        let repetitions = cycle_ns / traffic.interval_ns;
        for i in 0..repetitions {
            let start_ns = traffic.offset_ns + i * traffic.interval_ns;
            scheduled.push(Slot {
                start_ns,
                end_ns: start_ns + traffic.duration_ns,
                tc: traffic.tc,
            });
        }
    }

    scheduled.sort_by_key(|slot| (slot.start_ns, slot.tc));

    for pair in scheduled.windows(2) {
        if pair[0].end_ns > pair[1].start_ns {
            return Err(AdmissionError::ScheduleConflict);
        }
    }

    Ok(Schedule {
        cycle_ns,
        slots: pad_with_best_effort(&scheduled, cycle_ns),
    })
}

/// Fill the gaps between scheduled slots with best-effort slots
fn pad_with_best_effort(scheduled: &[Slot], cycle_ns: u64) -> Vec<Slot> {
    let mut slots = Vec::with_capacity(scheduled.len() * 2 + 1);
    let mut end_ns = 0;

    for slot in scheduled {
        if end_ns < slot.start_ns {
            slots.push(Slot {
                start_ns: end_ns,
                end_ns: slot.start_ns,
                tc: BEST_EFFORT_TC,
            });
        }
        slots.push(*slot);
        end_ns = slot.end_ns;
    }

    if end_ns < cycle_ns {
        slots.push(Slot {
            start_ns: end_ns,
            end_ns: cycle_ns,
            tc: BEST_EFFORT_TC,
        });
    }

    slots
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Pick a base time giving the kernel two full cycles of lead time
///
/// Read from `CLOCK_TAI` like the taprio qdisc itself; whether the host
/// clock is PTP-synchronised is up to the operator.
///
/// # Errors
///
/// Will return `Err` if the TAI clock cannot be read.
pub fn default_base_time_ns(cycle_ns: u64) -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_TAI).context("Reading CLOCK_TAI")?;

    let now_ns = u64::try_from(now.tv_sec())
        .context("CLOCK_TAI before the epoch")?
        .saturating_mul(NS_PER_S)
        + u64::try_from(now.tv_nsec()).context("Invalid nanosecond part")?;

    Ok(now_ns + BASE_TIME_LEAD_CYCLES * cycle_ns)
}
