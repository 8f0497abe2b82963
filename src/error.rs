// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Admission failure classification
//!
//! Every failure a client can observe as `ok=false` maps to one of these
//! variants. The service only forwards the message text; the variant itself
//! decides how the interface context reacts (reject and release the lock,
//! or quarantine the interface after a failed rollback).

use thiserror::Error;

/// A hardware or kernel resource the mapping can run out of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Socket priorities reservable for scheduled streams (7..=15)
    SocketPriority,

    /// Linux traffic classes usable by the taprio qdisc
    TrafficClass,

    /// Hardware transmit queues of the device
    TxQueue,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SocketPriority => write!(f, "socket priorities"),
            Self::TrafficClass => write!(f, "traffic classes"),
            Self::TxQueue => write!(f, "Tx queues"),
        }
    }
}

/// Why an admission was rejected
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The request itself is malformed or outside device limits
    #[error("invalid request: {0}")]
    Validation(String),

    /// No device profile is registered for the driver backing the interface
    #[error("no device profile for driver {driver:?} backing {interface}")]
    UnknownDevice {
        /// Requested interface name
        interface: String,
        /// Kernel driver id the lookup failed for
        driver: String,
    },

    /// The mapping ran out of an allocatable resource
    #[error("out of {0}")]
    NoCapacity(Resource),

    /// The stream's transmission slots overlap an already admitted stream
    #[error("stream conflicts with the existing schedule")]
    ScheduleConflict,

    /// A system configuration step failed and was rolled back completely
    #[error("system configuration failed, rolled back: {0}")]
    EffectorTransient(String),

    /// A rollback step failed, leaving the system in an unknown state
    #[error("system configuration failed and rollback incomplete: {0}")]
    EffectorFatal(String),

    /// The interface was quarantined by an earlier rollback failure
    #[error("interface {0} is degraded after an incomplete rollback, restart required")]
    InterfaceDegraded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_capacity_message_names_resource() {
        let err = AdmissionError::NoCapacity(Resource::TxQueue);
        assert_eq!(err.to_string(), "out of Tx queues");
    }

    #[test]
    fn test_unknown_device_message() {
        let err = AdmissionError::UnknownDevice {
            interface: "eth0".to_owned(),
            driver: "e1000e".to_owned(),
        };
        assert!(err.to_string().contains("e1000e"));
        assert!(err.to_string().contains("eth0"));
    }
}
