// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Domain model for stream admission requests
//!
//! A talker admission is described by three values: the interface to
//! transmit on, the [`StreamIdentification`] (where the frames go and when
//! within the cycle they leave) and the [`TrafficSpecification`] (how often
//! and how much). These are plain data; all system knowledge lives in the
//! device, scheduler and mapping modules.
//!
//! ```
//! use detd::configuration::{StreamIdentification, TrafficSpecification, TalkerConfig};
//!
//! let stream = StreamIdentification::new("8a:de:82:a1:59:5a".parse()?, 3, 6, 250_000, None)?;
//! let traffic = TrafficSpecification::new(2_000_000, 1522)?;
//! let config = TalkerConfig::new("eth0", stream, traffic)?;
//! assert_eq!(config.traffic.duration_ns(1_000_000_000), 12_176);
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::error::AdmissionError;
use eui48::MacAddress;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;

/// Highest VLAN id usable for a stream (4095 is reserved)
pub const VLAN_ID_MAX: u16 = 4094;

/// Highest priority code point of the 802.1Q tag
pub const PCP_MAX: u8 = 7;

const BITS_PER_BYTE: u64 = 8;
const NS_PER_S: u64 = 1_000_000_000;

/// Identifies a stream on the wire and its place within the cycle
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StreamIdentification {
    /// Destination MAC address of the stream
    #[serde(with = "serialize_mac_address")]
    pub destination: MacAddress,

    /// VLAN identifier (1..=4094)
    pub vid: u16,

    /// Priority Code Point stamped into the 802.1Q tag (0..=7)
    pub pcp: u8,

    /// Offset of the transmission slot relative to cycle start
    pub txoffset_ns: u64,

    /// Explicit taprio base time; None lets the service pick one
    pub base_time_ns: Option<u64>,
}

impl StreamIdentification {
    /// Validate and build a stream identification
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Validation`] for a VLAN id or PCP outside
    /// the 802.1Q ranges.
    pub fn new(
        destination: MacAddress,
        vid: u16,
        pcp: u8,
        txoffset_ns: u64,
        base_time_ns: Option<u64>,
    ) -> Result<Self, AdmissionError> {
        if vid == 0 || vid > VLAN_ID_MAX {
            return Err(AdmissionError::Validation(format!(
                "VLAN id {vid} outside 1..={VLAN_ID_MAX}"
            )));
        }

        if pcp > PCP_MAX {
            return Err(AdmissionError::Validation(format!(
                "PCP {pcp} outside 0..={PCP_MAX}"
            )));
        }

        Ok(Self {
            destination,
            vid,
            pcp,
            txoffset_ns,
            base_time_ns,
        })
    }
}

mod serialize_mac_address {
    use eui48::MacAddress;
    use serde::{self, Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(crate) fn serialize<S>(addr: &MacAddress, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_hex_string())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<MacAddress, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MacAddress::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Periodic bandwidth demand of a stream
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct TrafficSpecification {
    /// Cycle interval in nanoseconds
    pub interval_ns: u64,

    /// Frame size in bytes, including headers
    pub size_bytes: u32,
}

impl TrafficSpecification {
    /// Validate and build a traffic specification
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Validation`] for a zero interval or size.
    pub fn new(interval_ns: u64, size_bytes: u32) -> Result<Self, AdmissionError> {
        if interval_ns == 0 {
            return Err(AdmissionError::Validation(
                "interval must be positive".to_owned(),
            ));
        }

        if size_bytes == 0 {
            return Err(AdmissionError::Validation(
                "frame size must be positive".to_owned(),
            ));
        }

        Ok(Self {
            interval_ns,
            size_bytes,
        })
    }

    /// Wire time of one frame on a link of the given speed, rounded up
    #[must_use]
    pub fn duration_ns(&self, link_bps: u64) -> u64 {
        (u64::from(self.size_bytes) * BITS_PER_BYTE * NS_PER_S).div_ceil(link_bps)
    }
}

/// Transmission selection mechanism requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TxSelection {
    /// Enhancements for Scheduled Traffic (802.1Qbv gates)
    Est = 0,

    /// Strict priority selection
    StrictPriority = 1,
}

/// Datapath technology the client intends to transmit through
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DataPath {
    /// Plain AF_PACKET sockets
    AfPacket = 0,

    /// AF_XDP zero copy
    AfXdpZc = 1,
}

/// Optional client hints refining how the stream should be realised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hints {
    /// Gate-based or strict-priority transmission selection
    pub tx_selection: TxSelection,

    /// Whether the selection mechanism must be offloaded to hardware
    pub tx_selection_offload: bool,

    /// Requested datapath
    pub data_path: DataPath,

    /// Frame preemption (802.1Qbu)
    pub preemption: bool,

    /// Per-packet launch time control
    pub launch_time_control: bool,
}

/// A complete talker admission request
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TalkerConfig {
    /// Physical interface the stream leaves through
    pub interface: String,

    /// Stream identification
    pub stream: StreamIdentification,

    /// Traffic specification
    pub traffic: TrafficSpecification,

    /// Upper bound of the transmit window; checked against
    /// `txoffset + duration` once the link speed is known
    pub tx_window_max_ns: Option<u64>,

    /// Client hints; None falls back to the device profile defaults
    pub hints: Option<Hints>,
}

impl TalkerConfig {
    /// Validate and build a talker request
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Validation`] if the transmission offset
    /// does not fall within the interval.
    pub fn new(
        interface: &str,
        stream: StreamIdentification,
        traffic: TrafficSpecification,
    ) -> Result<Self, AdmissionError> {
        if stream.txoffset_ns >= traffic.interval_ns {
            return Err(AdmissionError::Validation(format!(
                "txoffset {} exceeds interval {}",
                stream.txoffset_ns, traffic.interval_ns
            )));
        }

        Ok(Self {
            interface: interface.to_owned(),
            stream,
            traffic,
            tx_window_max_ns: None,
            hints: None,
        })
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/detd/detd_service.sock")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lock/detd")
}

fn default_workers() -> usize {
    1
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024
}

/// Service-level settings, optionally loaded from a YAML file
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    /// Path of the Unix domain socket clients connect to
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path of the single-instance lock file
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Maximum number of connections served in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Frames longer than this terminate the connection
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            lock_path: default_lock_path(),
            workers: default_workers(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServiceSettings {
    /// Read settings from a YAML reader
    ///
    /// # Errors
    ///
    /// Will return `Err` if the YAML could not be parsed.
    pub fn read<R: Read>(reader: R) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_reader(reader)?)
    }
}
