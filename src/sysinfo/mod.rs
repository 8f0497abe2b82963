// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Read-only information about network interfaces
//!
//! The admission pipeline needs three facts about an interface: the kernel
//! driver backing it (to select the device profile), the link speed (to
//! derive frame wire times) and whether its operational state can be
//! queried at all. This trait is the only place such information enters the
//! crate, so tests replace it wholesale.
//!
//! ```no_run
//! use detd::sysinfo::{SystemInfo, NetlinkSystemInfo};
//!
//! # tokio_test::block_on(async {
//! let sysinfo = NetlinkSystemInfo::new();
//! let speed = sysinfo.link_speed_bps("eth0").await?;
//! println!("eth0 runs at {speed} bit/s");
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```

use anyhow::Result;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Read-only interface facts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SystemInfo {
    /// Kernel driver id backing the interface, e.g. `stmmac`
    async fn driver_name(&self, interface: &str) -> Result<String>;

    /// Current link speed in bit/s
    async fn link_speed_bps(&self, interface: &str) -> Result<u64>;

    /// Whether the interface is operationally up
    async fn is_operational(&self, interface: &str) -> Result<bool>;
}

mod netlink;
pub use netlink::NetlinkSystemInfo;
