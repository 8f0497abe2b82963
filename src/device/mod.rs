// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Per-device constants and constraints
//!
//! TSN-capable NICs differ in queue count, the ethtool features that must be
//! toggled for gated transmission to work, and the schedules their hardware
//! accepts. Instead of a class per device, a [`DeviceProfile`] record
//! captures these differences and a registry maps the kernel driver id
//! backing an interface to its profile.

use crate::configuration::{DataPath, Hints, TxSelection};
use crate::scheduler::Schedule;

/// TSN features a controller may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// 802.1Qbv gated transmission
    Qbv,

    /// 802.1Qbu frame preemption
    Qbu,

    /// Per-packet launch time control
    Ltc,
}

/// Static description of one NIC family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Human-readable family name
    pub name: &'static str,

    /// Number of hardware Tx queues
    pub num_tx_queues: u8,

    /// ethtool features to force, as `(feature, enable)` pairs
    pub features: &'static [(&'static str, bool)],

    /// Whether Energy-Efficient Ethernet must be switched off
    pub disable_eee: bool,

    /// Tx/Rx descriptor ring sizes to configure, if any
    pub ring_sizes: Option<(u32, u32)>,

    /// TSN capabilities of the controller
    pub capabilities: &'static [Capability],

    /// True if a hardware gate may open only once per cycle
    pub single_gate_open_per_cycle: bool,

    /// Longest cycle the hardware can realise, if limited
    pub max_cycle_ns: Option<u64>,
}

impl DeviceProfile {
    /// Check whether the hardware can realise the merged schedule
    #[must_use]
    pub fn supports_schedule(&self, schedule: &Schedule) -> bool {
        if self.single_gate_open_per_cycle && schedule.opens_gate_multiple_times_per_cycle() {
            return false;
        }

        if let Some(max_cycle_ns) = self.max_cycle_ns {
            if schedule.cycle_ns > max_cycle_ns {
                return false;
            }
        }

        true
    }

    /// Check whether the controller offers this capability
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Hints applied when a client does not provide any
    #[must_use]
    pub const fn default_hints(&self) -> Hints {
        Hints {
            tx_selection: TxSelection::Est,
            tx_selection_offload: false,
            data_path: DataPath::AfPacket,
            preemption: false,
            launch_time_control: false,
        }
    }

    /// Validate client hints against the controller capabilities
    ///
    /// # Errors
    ///
    /// Returns a description of the first unsupported request.
    pub fn check_hints(&self, hints: &Hints) -> Result<(), String> {
        if hints.data_path != DataPath::AfPacket {
            return Err(format!(
                "{} does not support the {:?} datapath",
                self.name, hints.data_path
            ));
        }

        if hints.tx_selection == TxSelection::Est
            && hints.tx_selection_offload
            && !self.has_capability(Capability::Qbv)
        {
            return Err(format!("{} cannot offload gated transmission", self.name));
        }

        if hints.preemption && !self.has_capability(Capability::Qbu) {
            return Err(format!("{} does not support frame preemption", self.name));
        }

        if hints.launch_time_control && !self.has_capability(Capability::Ltc) {
            return Err(format!(
                "{} does not support launch time control",
                self.name
            ));
        }

        Ok(())
    }
}

/// Integrated Intel mGBE controller (Elkhart Lake and friends), stmmac driver
static INTEL_MGBE: DeviceProfile = DeviceProfile {
    name: "Intel mGBE",
    num_tx_queues: 8,
    features: &[("rx-vlan-offload", false), ("hw-tc-offload", true)],
    disable_eee: true,
    ring_sizes: Some((1024, 1024)),
    capabilities: &[Capability::Qbv],
    single_gate_open_per_cycle: false,
    max_cycle_ns: None,
};

/// Intel i225/i226 controllers, igc driver
static INTEL_I225: DeviceProfile = DeviceProfile {
    name: "Intel i225",
    num_tx_queues: 4,
    features: &[("rx-vlan-offload", false)],
    disable_eee: true,
    ring_sizes: Some((1024, 1024)),
    capabilities: &[Capability::Qbv],
    single_gate_open_per_cycle: true,
    max_cycle_ns: None,
};

/// Intel i210 controller, igb driver
///
/// The i210 handler is a stub upstream: it claims no capabilities and
/// configures no features or rings, so every capability-gated hint is
/// refused. EEE is still switched off, as for all devices.
static INTEL_I210: DeviceProfile = DeviceProfile {
    name: "Intel i210",
    num_tx_queues: 4,
    features: &[],
    disable_eee: true,
    ring_sizes: None,
    capabilities: &[],
    single_gate_open_per_cycle: true,
    max_cycle_ns: None,
};

static REGISTRY: &[(&str, &DeviceProfile)] = &[
    ("stmmac", &INTEL_MGBE),
    ("stmmaceth", &INTEL_MGBE),
    ("igc", &INTEL_I225),
    ("igb", &INTEL_I210),
];

/// Look up the profile for a kernel driver id
#[must_use]
pub fn profile_for_driver(driver: &str) -> Option<&'static DeviceProfile> {
    REGISTRY
        .iter()
        .find(|(id, _)| *id == driver)
        .map(|(_, profile)| *profile)
}
