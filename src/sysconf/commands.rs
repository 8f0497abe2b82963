// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::sysconf::{SystemCommandRunner, TaprioSpec, VlanSpec, TAPRIO_FLAGS_FULL_OFFLOAD};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

// ethtool returns 80 when the configuration did not change
const ETHTOOL_SUCCESS_CODES: &[i32] = &[0, 80];
const DEFAULT_SUCCESS_CODES: &[i32] = &[0];

/// Executes system configuration through `tc`, `ip` and `ethtool`
#[derive(Debug, Default)]
pub struct ShellCommandRunner;

impl ShellCommandRunner {
    /// Create a new shell-backed command runner
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[String], success_codes: &[i32]) -> Result<String> {
        debug!("Running: {program} {}", args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Spawning {program}"))?;

        let code = output.status.code().unwrap_or(-1);
        if !success_codes.contains(&code) {
            return Err(anyhow!(
                "{program} exited with status {code}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SystemCommandRunner for ShellCommandRunner {
    async fn eee_enabled(&self, interface: &str) -> Result<bool> {
        let output = Self::run(
            "ethtool",
            &["--show-eee".to_owned(), interface.to_owned()],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;

        parse_eee_status(&output)
            .ok_or_else(|| anyhow!("ethtool reported no EEE status for {interface}"))
    }

    async fn set_eee(&self, interface: &str, enable: bool) -> Result<()> {
        Self::run(
            "ethtool",
            &[
                "--set-eee".to_owned(),
                interface.to_owned(),
                "eee".to_owned(),
                on_off(enable).to_owned(),
            ],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;
        Ok(())
    }

    async fn feature_enabled(&self, interface: &str, feature: &str) -> Result<bool> {
        let output = Self::run(
            "ethtool",
            &["--show-features".to_owned(), interface.to_owned()],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;

        parse_feature_state(&output, feature)
            .ok_or_else(|| anyhow!("ethtool does not list feature {feature} for {interface}"))
    }

    async fn set_feature(&self, interface: &str, feature: &str, enable: bool) -> Result<()> {
        Self::run(
            "ethtool",
            &[
                "--features".to_owned(),
                interface.to_owned(),
                feature.to_owned(),
                on_off(enable).to_owned(),
            ],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;
        Ok(())
    }

    async fn ring_sizes(&self, interface: &str) -> Result<(u32, u32)> {
        let output = Self::run(
            "ethtool",
            &["--show-ring".to_owned(), interface.to_owned()],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;

        parse_ring_sizes(&output)
            .ok_or_else(|| anyhow!("ethtool reported no ring sizes for {interface}"))
    }

    async fn set_ring_sizes(&self, interface: &str, tx: u32, rx: u32) -> Result<()> {
        Self::run(
            "ethtool",
            &[
                "--set-ring".to_owned(),
                interface.to_owned(),
                "tx".to_owned(),
                tx.to_string(),
                "rx".to_owned(),
                rx.to_string(),
            ],
            ETHTOOL_SUCCESS_CODES,
        )
        .await?;
        Ok(())
    }

    async fn replace_taprio(&self, interface: &str, spec: &TaprioSpec) -> Result<()> {
        Self::run("tc", &taprio_replace_args(interface, spec), DEFAULT_SUCCESS_CODES).await?;
        Ok(())
    }

    async fn delete_root_qdisc(&self, interface: &str) -> Result<()> {
        let args: Vec<String> = ["qdisc", "del", "dev", interface, "root"]
            .iter()
            .map(ToString::to_string)
            .collect();
        Self::run("tc", &args, DEFAULT_SUCCESS_CODES).await?;
        Ok(())
    }

    async fn add_vlan(&self, spec: &VlanSpec) -> Result<()> {
        Self::run("ip", &vlan_add_args(spec), DEFAULT_SUCCESS_CODES).await?;
        Ok(())
    }

    async fn delete_vlan(&self, name: &str) -> Result<()> {
        let args: Vec<String> = ["link", "delete", name]
            .iter()
            .map(ToString::to_string)
            .collect();
        Self::run("ip", &args, DEFAULT_SUCCESS_CODES).await?;
        Ok(())
    }
}

const fn on_off(enable: bool) -> &'static str {
    if enable {
        "on"
    } else {
        "off"
    }
}

fn taprio_replace_args(interface: &str, spec: &TaprioSpec) -> Vec<String> {
    let mut args: Vec<String> = ["qdisc", "replace", "dev", interface, "parent", "root", "taprio"]
        .iter()
        .map(ToString::to_string)
        .collect();

    args.push("num_tc".to_owned());
    args.push(spec.num_tc.to_string());

    args.push("map".to_owned());
    for tc in spec.priority_map {
        args.push(tc.to_string());
    }

    args.push("queues".to_owned());
    for (count, offset) in &spec.queues {
        args.push(format!("{count}@{offset}"));
    }

    args.push("base-time".to_owned());
    args.push(spec.base_time_ns.to_string());

    for entry in &spec.entries {
        args.push("sched-entry".to_owned());
        args.push(entry.operation.symbol().to_string());
        args.push(entry.gate_states_hex());
        args.push(entry.time_interval_value_ns.to_string());
    }

    args.push("flags".to_owned());
    args.push(format!("{TAPRIO_FLAGS_FULL_OFFLOAD:#x}"));

    args
}

fn vlan_add_args(spec: &VlanSpec) -> Vec<String> {
    let mut args = vec![
        "link".to_owned(),
        "add".to_owned(),
        "link".to_owned(),
        spec.parent.clone(),
        "name".to_owned(),
        spec.name(),
        "type".to_owned(),
        "vlan".to_owned(),
        "protocol".to_owned(),
        "802.1Q".to_owned(),
        "id".to_owned(),
        spec.vid.to_string(),
    ];

    args.push("egress".to_owned());
    for (priority, pcp) in &spec.egress {
        args.push(format!("{priority}:{pcp}"));
    }

    args
}

fn parse_eee_status(output: &str) -> Option<bool> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("EEE status:"))
        .map(|status| status.contains("enabled"))
}

fn parse_feature_state(output: &str, feature: &str) -> Option<bool> {
    output.lines().find_map(|line| {
        let (name, state) = line.trim().split_once(':')?;
        (name.trim() == feature).then(|| state.trim_start().starts_with("on"))
    })
}

fn parse_ring_sizes(output: &str) -> Option<(u32, u32)> {
    let current = output.split("Current hardware settings:").nth(1)?;

    let mut tx = None;
    let mut rx = None;
    for line in current.lines() {
        if let Some(value) = line.trim().strip_prefix("RX:") {
            rx = value.trim().parse().ok();
        } else if let Some(value) = line.trim().strip_prefix("TX:") {
            tx = value.trim().parse().ok();
        }
    }

    Some((tx?, rx?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PRIORITY_MAP_LEN;
    use crate::scheduler::{GateControlEntry, GateOperation};

    fn scenario_spec() -> TaprioSpec {
        let mut priority_map = [0u8; PRIORITY_MAP_LEN];
        priority_map[7] = 1;
        TaprioSpec {
            num_tc: 2,
            priority_map,
            queues: vec![(1, 0), (1, 7)],
            base_time_ns: 1_666_000_000_000_000_000,
            entries: vec![
                GateControlEntry {
                    operation: GateOperation::SetGates,
                    time_interval_value_ns: 250_000,
                    gate_states_value: 0x01,
                },
                GateControlEntry {
                    operation: GateOperation::SetGates,
                    time_interval_value_ns: 12_176,
                    gate_states_value: 0x02,
                },
                GateControlEntry {
                    operation: GateOperation::SetGates,
                    time_interval_value_ns: 1_737_824,
                    gate_states_value: 0x01,
                },
            ],
        }
    }

    #[test]
    fn test_taprio_replace_args() {
        let args = taprio_replace_args("eth0", &scenario_spec());
        let rendered = args.join(" ");

        assert_eq!(
            rendered,
            "qdisc replace dev eth0 parent root taprio \
             num_tc 2 \
             map 0 0 0 0 0 0 0 1 0 0 0 0 0 0 0 0 \
             queues 1@0 1@7 \
             base-time 1666000000000000000 \
             sched-entry S 01 250000 \
             sched-entry S 02 12176 \
             sched-entry S 01 1737824 \
             flags 0x2"
        );
    }

    #[test]
    fn test_vlan_add_args() {
        let spec = VlanSpec {
            parent: "eth0".to_owned(),
            vid: 3,
            egress: vec![(0, 0), (7, 6)],
        };

        assert_eq!(
            vlan_add_args(&spec).join(" "),
            "link add link eth0 name eth0.3 type vlan protocol 802.1Q id 3 egress 0:0 7:6"
        );
    }

    #[test]
    fn test_parse_eee_status() {
        let output = concat!(
            "EEE settings for eth0:\n",
            "\tEEE status: disabled\n",
            "\tTx LPI: disabled\n",
        );
        assert_eq!(parse_eee_status(output), Some(false));

        let output = concat!(
            "EEE settings for eth0:\n",
            "\tEEE status: enabled - active\n",
        );
        assert_eq!(parse_eee_status(output), Some(true));

        assert_eq!(parse_eee_status("no such line\n"), None);
    }

    #[test]
    fn test_parse_feature_state() {
        let output = concat!(
            "Features for eth0:\n",
            "rx-checksumming: on\n",
            "rx-vlan-offload: off [fixed]\n",
            "hw-tc-offload: on\n",
        );
        assert_eq!(parse_feature_state(output, "rx-vlan-offload"), Some(false));
        assert_eq!(parse_feature_state(output, "hw-tc-offload"), Some(true));
        assert_eq!(parse_feature_state(output, "tx-nocache-copy"), None);
    }

    #[test]
    fn test_parse_ring_sizes() {
        let output = concat!(
            "Ring parameters for eth0:\n",
            "Pre-set maximums:\n",
            "RX:\t4096\n",
            "TX:\t4096\n",
            "Current hardware settings:\n",
            "RX:\t256\n",
            "TX:\t512\n",
        );
        assert_eq!(parse_ring_sizes(output), Some((512, 256)));
        assert_eq!(parse_ring_sizes("Ring parameters for eth0:\n"), None);
    }
}
