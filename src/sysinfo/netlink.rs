// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::sysinfo::SystemInfo;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethtool::EthtoolAttr::LinkMode;
use ethtool::EthtoolLinkModeAttr::Speed;
use futures::stream::TryStreamExt;
use netlink_packet_route::link::LinkAttribute::OperState;
use netlink_packet_route::link::{LinkMessage, State};
use rtnetlink::Handle;
use std::path::PathBuf;

const MBPS_TO_BPS: u64 = 1_000_000;
const SPEED_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Interface facts via rtnetlink, ethtool-netlink and sysfs
#[derive(Debug, Default)]
pub struct NetlinkSystemInfo;

impl NetlinkSystemInfo {
    /// Create a new netlink-backed system information source
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn get_interface(interface: &str, handle: &Handle) -> Option<LinkMessage> {
        let mut links = handle
            .link()
            .get()
            .match_name(String::from(interface))
            .execute();

        match links.try_next().await {
            Ok(Some(msg)) => Some(msg),
            Err(_) | Ok(None) => None,
        }
    }
}

#[async_trait]
impl SystemInfo for NetlinkSystemInfo {
    async fn driver_name(&self, interface: &str) -> Result<String> {
        let link = PathBuf::from("/sys/class/net")
            .join(interface)
            .join("device/driver");

        let target = tokio::fs::read_link(&link)
            .await
            .with_context(|| format!("No driver entry for {interface}"))?;

        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Unusable driver link for {interface}"))
    }

    async fn link_speed_bps(&self, interface: &str) -> Result<u64> {
        let (connection, mut handle, _) = ethtool::new_connection()?;
        tokio::spawn(connection);

        let mut link_mode_handle = handle.link_mode().get(Some(interface)).execute().await;

        while let Some(msg) = link_mode_handle.try_next().await? {
            let speed = msg.payload.nlas.iter().find_map(|d| match d {
                LinkMode(Speed(speed)) => Some(*speed),
                _ => None,
            });

            if let Some(speed) = speed {
                return match speed {
                    0 | SPEED_UNKNOWN => Err(anyhow!("Link speed of {interface} is unknown")),
                    _ => Ok(u64::from(speed) * MBPS_TO_BPS),
                };
            }
        }

        Err(anyhow!("No ethtool link mode speed message received"))
    }

    async fn is_operational(&self, interface: &str) -> Result<bool> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = Self::get_interface(interface, &handle)
            .await
            .ok_or_else(|| anyhow!("No interface {interface} found"))?;

        let state = link
            .attributes
            .iter()
            .find_map(|d| match d {
                OperState(state) => Some(state),
                _ => None,
            })
            .ok_or_else(|| anyhow!("No operational state reported for {interface}"))?;

        Ok(matches!(state, State::Up))
    }
}
