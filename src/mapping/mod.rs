// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Allocation of socket priorities, traffic classes and Tx queues
//!
//! One [`Mapping`] exists per interface. It owns three tables:
//!
//! * `priority -> traffic class`, 16 entries, rendered into the taprio
//!   `map` parameter
//! * `traffic class -> Tx queue`, rendered into the taprio `queues`
//!   parameter
//! * `priority -> PCP`, rendered into the VLAN egress map
//!
//! Socket priorities 0..=6 are never handed out: 0 is the Linux default for
//! unclassified traffic and 1..=6 can be set without `CAP_NET_ADMIN`, so
//! only 7..=15 identify scheduled streams. Scheduled traffic classes count
//! up from 1; queues are taken from the highest index downwards because
//! high-index queues carry scheduled traffic on the supported NICs.
//!
//! The type is `Clone`; callers allocate on a copy and swap it in only
//! after the system configuration succeeded.

use crate::error::{AdmissionError, Resource};
use std::collections::BTreeMap;

/// Socket priority assigned to best-effort traffic
pub const BEST_EFFORT_PRIORITY: u8 = 0;

/// Traffic class assigned to best-effort traffic
pub const BEST_EFFORT_TC: u8 = 0;

/// Tx queue assigned to best-effort traffic
pub const BEST_EFFORT_QUEUE: u8 = 0;

/// Number of socket priorities covered by the taprio priority map
pub const PRIORITY_MAP_LEN: usize = 16;

const FIRST_STREAM_PRIORITY: u8 = 7;
const FIRST_STREAM_TC: u8 = 1;

/// Resources handed to one admitted stream
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Allocation {
    /// Socket priority the application must set via `SO_PRIORITY`
    pub socket_priority: u8,

    /// Traffic class whose gate is dedicated to the stream
    pub traffic_class: u8,

    /// Hardware Tx queue serving the traffic class
    pub queue: u8,
}

/// Resource tables of one interface
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Mapping {
    free_priorities: Vec<u8>,
    free_tcs: Vec<u8>,
    free_queues: Vec<u8>,
    priority_to_tc: [u8; PRIORITY_MAP_LEN],
    priority_to_pcp: BTreeMap<u8, u8>,
    tc_to_queue: BTreeMap<u8, u8>,
}

impl Mapping {
    /// Create the initial mapping for a device with the given queue count
    ///
    /// Everything starts out as best effort: all priorities map to TC 0 and
    /// TC 0 maps to queue 0.
    #[must_use]
    pub fn new(num_tx_queues: u8) -> Self {
        let last_priority = u8::try_from(PRIORITY_MAP_LEN - 1).unwrap_or(u8::MAX);

        Self {
            free_priorities: (FIRST_STREAM_PRIORITY..=last_priority).collect(),
            free_tcs: (FIRST_STREAM_TC..=last_priority).collect(),
            free_queues: (0..num_tx_queues).rev().collect(),
            priority_to_tc: [BEST_EFFORT_TC; PRIORITY_MAP_LEN],
            priority_to_pcp: BTreeMap::from([(BEST_EFFORT_PRIORITY, 0)]),
            tc_to_queue: BTreeMap::from([(BEST_EFFORT_TC, BEST_EFFORT_QUEUE)]),
        }
    }

    /// Allocate the next free priority, traffic class and queue for a stream
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NoCapacity`] naming the exhausted resource.
    /// The mapping is not modified in that case.
    pub fn assign(&mut self, pcp: u8) -> Result<Allocation, AdmissionError> {
        if self.free_priorities.is_empty() {
            return Err(AdmissionError::NoCapacity(Resource::SocketPriority));
        }
        if self.free_tcs.is_empty() {
            return Err(AdmissionError::NoCapacity(Resource::TrafficClass));
        }
        if self.free_queues.is_empty() {
            return Err(AdmissionError::NoCapacity(Resource::TxQueue));
        }

        let socket_priority = self.free_priorities.remove(0);
        let traffic_class = self.free_tcs.remove(0);
        let queue = self.free_queues.remove(0);

        self.priority_to_tc[usize::from(socket_priority)] = traffic_class;
        self.priority_to_pcp.insert(socket_priority, pcp);
        self.tc_to_queue.insert(traffic_class, queue);

        Ok(Allocation {
            socket_priority,
            traffic_class,
            queue,
        })
    }

    /// The 16-entry priority to traffic-class table (taprio `map`)
    #[must_use]
    pub const fn priority_map(&self) -> [u8; PRIORITY_MAP_LEN] {
        self.priority_to_tc
    }

    /// Queue ranges per traffic class as `(count, offset)` pairs
    ///
    /// One single-queue range per traffic class, ordered by traffic class,
    /// matching the `1@q` notation of `tc`.
    #[must_use]
    pub fn queue_mapping(&self) -> Vec<(u16, u16)> {
        self.tc_to_queue
            .values()
            .map(|queue| (1, u16::from(*queue)))
            .collect()
    }

    /// Priority to PCP pairs for the VLAN egress map, ordered by priority
    #[must_use]
    pub fn egress_map(&self) -> Vec<(u8, u8)> {
        self.priority_to_pcp
            .iter()
            .map(|(prio, pcp)| (*prio, *pcp))
            .collect()
    }
}
