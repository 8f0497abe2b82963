// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Routing of admissions to per-interface contexts
//!
//! The [`Manager`] owns the only process-wide mutable state: the registry of
//! [`InterfaceContext`]s, created on first use and guarded by a short-lived
//! lock that is never held across an admission. Each context serialises its
//! interface with its own lock, held from resource allocation until the
//! system configuration either committed or rolled back, so admissions on
//! different interfaces proceed in parallel while admissions on the same
//! interface are strictly ordered.

use crate::configuration::TalkerConfig;
use crate::device::{profile_for_driver, DeviceProfile};
use crate::error::AdmissionError;
use crate::mapping::Mapping;
use crate::scheduler::{default_base_time_ns, Scheduler, Traffic};
use crate::sysconf::{Action, Effector, TaprioSpec, VlanSpec};
use crate::sysinfo::SystemInfo;
use futures::lock::Mutex;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// What a client needs to actually transmit its admitted stream
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TalkerHandle {
    /// VLAN sub-interface to bind to, e.g. `eth0.3`
    pub vlan_interface: String,

    /// Socket priority to set via `SO_PRIORITY`
    pub socket_priority: u8,
}

/// Record of one successful admission
#[derive(Debug, Clone)]
pub struct Admission {
    /// The admitted request
    pub config: TalkerConfig,

    /// Traffic class dedicated to the stream
    pub traffic_class: u8,

    /// Socket priority handed to the client
    pub socket_priority: u8,
}

/// Routes requests to interface contexts, creating them on first use
pub struct Manager {
    sysinfo: Arc<dyn SystemInfo + Send + Sync>,
    effector: Effector,
    contexts: Mutex<HashMap<String, Arc<InterfaceContext>>>,
}

impl Manager {
    /// Create a manager using the given information source and effector
    pub fn new(sysinfo: Arc<dyn SystemInfo + Send + Sync>, effector: Effector) -> Self {
        Self {
            sysinfo,
            effector,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a talker stream on its interface
    ///
    /// # Errors
    ///
    /// See [`AdmissionError`]; nothing is committed on any error.
    pub async fn add_talker(&self, config: &TalkerConfig) -> Result<TalkerHandle, AdmissionError> {
        let context = self.context(&config.interface).await?;
        context.add_talker(config).await
    }

    async fn context(&self, interface: &str) -> Result<Arc<InterfaceContext>, AdmissionError> {
        if let Some(context) = self.contexts.lock().await.get(interface) {
            return Ok(context.clone());
        }

        // Bind the device profile outside the registry lock
        let driver = self
            .sysinfo
            .driver_name(interface)
            .await
            .map_err(|err| AdmissionError::Validation(format!("{err:#}")))?;

        let profile =
            profile_for_driver(&driver).ok_or_else(|| AdmissionError::UnknownDevice {
                interface: interface.to_owned(),
                driver,
            })?;

        let context = Arc::new(InterfaceContext::new(
            interface,
            profile,
            self.sysinfo.clone(),
            self.effector.clone(),
        ));

        // A concurrent first admission may have won the race; use its context
        Ok(self
            .contexts
            .lock()
            .await
            .entry(interface.to_owned())
            .or_insert(context)
            .clone())
    }
}

/// Per-interface admission state and pipeline
pub struct InterfaceContext {
    interface: String,
    profile: &'static DeviceProfile,
    sysinfo: Arc<dyn SystemInfo + Send + Sync>,
    effector: Effector,
    state: Mutex<InterfaceState>,
}

struct InterfaceState {
    mapping: Mapping,
    scheduler: Scheduler,
    committed_taprio: Option<TaprioSpec>,
    admissions: Vec<Admission>,
    configured_vids: Vec<u16>,
    degraded: bool,
}

impl InterfaceContext {
    fn new(
        interface: &str,
        profile: &'static DeviceProfile,
        sysinfo: Arc<dyn SystemInfo + Send + Sync>,
        effector: Effector,
    ) -> Self {
        info!(
            "Binding {interface} to device profile {} ({} Tx queues)",
            profile.name, profile.num_tx_queues
        );

        Self {
            interface: interface.to_owned(),
            profile,
            sysinfo,
            effector,
            state: Mutex::new(InterfaceState {
                mapping: Mapping::new(profile.num_tx_queues),
                scheduler: Scheduler::default(),
                committed_taprio: None,
                admissions: Vec::new(),
                configured_vids: Vec::new(),
                degraded: false,
            }),
        }
    }

    /// Admit a talker stream on this interface
    ///
    /// Allocates resources and merges the schedule on copies of the current
    /// state, applies the system configuration transactionally and commits
    /// the copies only on success.
    pub async fn add_talker(&self, config: &TalkerConfig) -> Result<TalkerHandle, AdmissionError> {
        // Read-only checks before taking the interface lock
        match self.sysinfo.is_operational(&self.interface).await {
            Ok(true) => {}
            Ok(false) => warn!("{} is not operationally up", self.interface),
            Err(err) => {
                return Err(AdmissionError::Validation(format!(
                    "cannot query operational state of {}: {err:#}",
                    self.interface
                )))
            }
        }

        let link_bps = self
            .sysinfo
            .link_speed_bps(&self.interface)
            .await
            .map_err(|err| AdmissionError::Validation(format!("{err:#}")))?;

        let duration_ns = config.traffic.duration_ns(link_bps);
        self.validate(config, duration_ns)?;

        let mut state = self.state.lock().await;

        if state.degraded {
            return Err(AdmissionError::InterfaceDegraded(self.interface.clone()));
        }

        // Tentative allocation on copies of the committed state
        let mut mapping = state.mapping.clone();
        let allocation = mapping.assign(config.stream.pcp)?;

        let traffic = Traffic::new(
            allocation.traffic_class,
            config.traffic.interval_ns,
            config.stream.txoffset_ns,
            duration_ns,
        );
        let (scheduler, schedule) = state.scheduler.admit(traffic)?;

        if !self.profile.supports_schedule(&schedule) {
            return Err(AdmissionError::Validation(format!(
                "{} cannot realise the resulting schedule",
                self.profile.name
            )));
        }

        let base_time_ns = match config.stream.base_time_ns {
            Some(base_time_ns) => base_time_ns,
            None => default_base_time_ns(schedule.cycle_ns).map_err(|err| {
                AdmissionError::Validation(format!("cannot determine base time: {err:#}"))
            })?,
        };

        let taprio = TaprioSpec {
            num_tc: schedule.num_traffic_classes(),
            priority_map: mapping.priority_map(),
            queues: mapping.queue_mapping(),
            base_time_ns,
            entries: schedule.gate_control_list(),
        };

        let actions = self.render_actions(&state, &mapping, &taprio, config.stream.vid);

        match self.effector.apply(actions).await {
            Ok(()) => {}
            Err(err @ AdmissionError::EffectorFatal(_)) => {
                warn!(
                    "Quarantining {} after an incomplete rollback",
                    self.interface
                );
                state.degraded = true;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        // Commit
        state.mapping = mapping;
        state.scheduler = scheduler;
        state.committed_taprio = Some(taprio);
        if !state.configured_vids.contains(&config.stream.vid) {
            state.configured_vids.push(config.stream.vid);
        }
        state.admissions.push(Admission {
            config: config.clone(),
            traffic_class: allocation.traffic_class,
            socket_priority: allocation.socket_priority,
        });

        let vlan_interface = format!("{}.{}", self.interface, config.stream.vid);
        info!(
            "Admitted stream to {} on {vlan_interface}: tc {}, queue {}, priority {}, {} streams total",
            config.stream.destination.to_hex_string(),
            allocation.traffic_class,
            allocation.queue,
            allocation.socket_priority,
            state.admissions.len()
        );

        Ok(TalkerHandle {
            vlan_interface,
            socket_priority: allocation.socket_priority,
        })
    }

    fn validate(&self, config: &TalkerConfig, duration_ns: u64) -> Result<(), AdmissionError> {
        let interval_ns = config.traffic.interval_ns;
        let txoffset_ns = config.stream.txoffset_ns;

        if duration_ns > interval_ns {
            return Err(AdmissionError::Validation(format!(
                "frame needs {duration_ns} ns on the wire, more than the interval of {interval_ns} ns"
            )));
        }

        if txoffset_ns + duration_ns > interval_ns {
            return Err(AdmissionError::Validation(format!(
                "transmission window [{txoffset_ns}, {}) exceeds the interval of {interval_ns} ns",
                txoffset_ns + duration_ns
            )));
        }

        // txmin is authoritative; a txmax is only accepted if it is redundant
        if let Some(txmax_ns) = config.tx_window_max_ns {
            if txmax_ns != txoffset_ns && txmax_ns != txoffset_ns + duration_ns {
                return Err(AdmissionError::Validation(format!(
                    "txmax {txmax_ns} matches neither txmin nor txmin plus the frame duration"
                )));
            }
        }

        if let Some(max_cycle_ns) = self.profile.max_cycle_ns {
            if interval_ns > max_cycle_ns {
                return Err(AdmissionError::Validation(format!(
                    "interval {interval_ns} ns exceeds the device limit of {max_cycle_ns} ns"
                )));
            }
        }

        let hints = config.hints.unwrap_or_else(|| self.profile.default_hints());
        self.profile
            .check_hints(&hints)
            .map_err(AdmissionError::Validation)?;

        Ok(())
    }

    fn render_actions(
        &self,
        state: &InterfaceState,
        mapping: &Mapping,
        taprio: &TaprioSpec,
        vid: u16,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.profile.disable_eee {
            actions.push(Action::SetEee {
                interface: self.interface.clone(),
                enable: false,
            });
        }

        for (feature, enable) in self.profile.features {
            actions.push(Action::SetFeature {
                interface: self.interface.clone(),
                feature: (*feature).to_owned(),
                enable: *enable,
            });
        }

        if let Some((tx, rx)) = self.profile.ring_sizes {
            actions.push(Action::SetRingSizes {
                interface: self.interface.clone(),
                tx,
                rx,
            });
        }

        actions.push(Action::ReplaceQdisc {
            interface: self.interface.clone(),
            spec: taprio.clone(),
            prior: state.committed_taprio.clone(),
        });

        // Streams sharing a VID share the sub-interface
        if !state.configured_vids.contains(&vid) {
            actions.push(Action::AddVlan {
                spec: VlanSpec {
                    parent: self.interface.clone(),
                    vid,
                    egress: mapping.egress_map(),
                },
            });
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{StreamIdentification, TrafficSpecification};
    use crate::sysconf::MockSystemCommandRunner;
    use crate::sysinfo::MockSystemInfo;
    use anyhow::anyhow;

    const GBPS: u64 = 1_000_000_000;
    const MS: u64 = 1_000_000;
    const BASE_TIME: u64 = 10_000_000;

    fn talker(vid: u16, pcp: u8, interval_ns: u64, txoffset_ns: u64, size: u32) -> TalkerConfig {
        let stream = StreamIdentification::new(
            "8a:de:82:a1:59:5a".parse().unwrap(),
            vid,
            pcp,
            txoffset_ns,
            Some(BASE_TIME),
        )
        .unwrap();
        let traffic = TrafficSpecification::new(interval_ns, size).unwrap();
        TalkerConfig::new("eth0", stream, traffic).unwrap()
    }

    fn sysinfo(driver: &'static str) -> MockSystemInfo {
        let mut sysinfo = MockSystemInfo::new();
        sysinfo
            .expect_driver_name()
            .returning(move |_| Ok(driver.to_owned()));
        sysinfo.expect_link_speed_bps().returning(|_| Ok(GBPS));
        sysinfo.expect_is_operational().returning(|_| Ok(true));
        sysinfo
    }

    fn permissive_runner() -> MockSystemCommandRunner {
        let mut runner = MockSystemCommandRunner::new();
        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().returning(|_, _| Ok(()));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_set_feature().returning(|_, _, _| Ok(()));
        runner.expect_ring_sizes().returning(|_| Ok((256, 256)));
        runner.expect_set_ring_sizes().returning(|_, _, _| Ok(()));
        runner.expect_replace_taprio().returning(|_, _| Ok(()));
        runner.expect_add_vlan().returning(|_| Ok(()));
        runner
    }

    fn manager(sysinfo: MockSystemInfo, runner: MockSystemCommandRunner) -> Manager {
        Manager::new(
            Arc::new(sysinfo),
            Effector::new(Arc::new(runner)),
        )
    }

    #[tokio::test]
    async fn test_first_admission() {
        let manager = manager(sysinfo("stmmac"), permissive_runner());

        let handle = manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap();

        assert_eq!(handle.vlan_interface, "eth0.3");
        assert_eq!(handle.socket_priority, 7);
    }

    #[tokio::test]
    async fn test_first_admission_taprio_rendering() {
        let mut runner = MockSystemCommandRunner::new();
        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().returning(|_, _| Ok(()));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_set_feature().returning(|_, _, _| Ok(()));
        runner.expect_ring_sizes().returning(|_| Ok((256, 256)));
        runner.expect_set_ring_sizes().returning(|_, _, _| Ok(()));
        runner
            .expect_replace_taprio()
            .withf(|interface, spec| {
                let mut expected_map = [0u8; 16];
                expected_map[7] = 1;
                let durations: Vec<u64> = spec
                    .entries
                    .iter()
                    .map(|e| e.time_interval_value_ns)
                    .collect();
                let masks: Vec<u16> =
                    spec.entries.iter().map(|e| e.gate_states_value).collect();

                interface == "eth0"
                    && spec.num_tc == 2
                    && spec.priority_map == expected_map
                    && spec.queues == vec![(1, 0), (1, 7)]
                    && spec.base_time_ns == BASE_TIME
                    && durations == vec![250_000, 12_176, 1_737_824]
                    && masks == vec![0x01, 0x02, 0x01]
            })
            .times(1)
            .returning(|_, _| Ok(()));
        runner
            .expect_add_vlan()
            .withf(|spec| {
                spec.name() == "eth0.3" && spec.egress == vec![(0, 0), (7, 6)]
            })
            .times(1)
            .returning(|_| Ok(()));

        let manager = manager(sysinfo("stmmac"), runner);
        manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_admission_shares_vlan() {
        let mut runner = MockSystemCommandRunner::new();
        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().returning(|_, _| Ok(()));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_set_feature().returning(|_, _, _| Ok(()));
        runner.expect_ring_sizes().returning(|_| Ok((256, 256)));
        runner.expect_set_ring_sizes().returning(|_, _, _| Ok(()));
        runner.expect_replace_taprio().returning(|_, _| Ok(()));
        // only the first admission creates the sub-interface
        runner.expect_add_vlan().times(1).returning(|_| Ok(()));

        let manager = manager(sysinfo("stmmac"), runner);

        let first = manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap();
        let second = manager
            .add_talker(&talker(3, 5, 2 * MS, 1_000_000, 512))
            .await
            .unwrap();

        assert_eq!(first.socket_priority, 7);
        assert_eq!(second.vlan_interface, "eth0.3");
        assert_eq!(second.socket_priority, 8);
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let manager = manager(sysinfo("e1000e"), MockSystemCommandRunner::new());

        let err = manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_schedule_conflict_without_system_calls() {
        let manager = manager(sysinfo("stmmac"), permissive_runner());

        manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap();

        // second stream at the same offset; the effector must not run again,
        // which the mock enforces through the add_vlan call count elsewhere
        let err = manager
            .add_talker(&talker(4, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::ScheduleConflict));

        // the next valid stream still gets priority 8: nothing was committed
        let handle = manager
            .add_talker(&talker(3, 5, 2 * MS, 1_000_000, 512))
            .await
            .unwrap();
        assert_eq!(handle.socket_priority, 8);
    }

    #[tokio::test]
    async fn test_rollback_keeps_state_reusable() {
        let mut runner = MockSystemCommandRunner::new();
        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().returning(|_, _| Ok(()));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_set_feature().returning(|_, _, _| Ok(()));
        runner.expect_ring_sizes().returning(|_| Ok((256, 256)));
        runner.expect_set_ring_sizes().returning(|_, _, _| Ok(()));
        runner.expect_replace_taprio().returning(|_, _| Ok(()));
        runner.expect_delete_root_qdisc().returning(|_| Ok(()));
        // first VLAN creation fails, the retry succeeds
        runner
            .expect_add_vlan()
            .times(1)
            .returning(|_| Err(anyhow!("RTNETLINK answers: Operation not permitted")));
        runner.expect_add_vlan().times(1).returning(|_| Ok(()));

        let manager = manager(sysinfo("stmmac"), runner);
        let config = talker(3, 6, 2 * MS, 250_000, 1522);

        let err = manager.add_talker(&config).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorTransient(_)));

        // the failed admission released everything it had reserved
        let handle = manager.add_talker(&config).await.unwrap();
        assert_eq!(handle.socket_priority, 7);
    }

    #[tokio::test]
    async fn test_fatal_rollback_quarantines_interface() {
        let mut runner = MockSystemCommandRunner::new();
        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().returning(|_, _| Ok(()));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_set_feature().returning(|_, _, _| Ok(()));
        runner.expect_ring_sizes().returning(|_| Ok((256, 256)));
        // the snapshotting call succeeds; the rollback to it fails
        runner
            .expect_set_ring_sizes()
            .times(1)
            .returning(|_, _, _| Ok(()));
        runner
            .expect_replace_taprio()
            .returning(|_, _| Err(anyhow!("injected")));
        runner
            .expect_set_ring_sizes()
            .returning(|_, _, _| Err(anyhow!("device wedged")));

        let manager = manager(sysinfo("stmmac"), runner);
        let config = talker(3, 6, 2 * MS, 250_000, 1522);

        let err = manager.add_talker(&config).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorFatal(_)));

        let err = manager.add_talker(&config).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InterfaceDegraded(_)));
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_on_four_queue_device() {
        let manager = manager(sysinfo("igc"), permissive_runner());

        // back-to-back slots keep every gate at a single opening per cycle,
        // which the i225 profile insists on
        let duration = 800; // 100 bytes at 1 Gbps
        for i in 0..4u64 {
            let config = talker(3, 6, 2 * MS, i * duration, 100);
            manager.add_talker(&config).await.unwrap();
        }

        let err = manager
            .add_talker(&talker(3, 6, 2 * MS, 4 * duration, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn test_single_gate_constraint_enforced() {
        let manager = manager(sysinfo("igc"), permissive_runner());

        // a hole before the slot forces the best-effort gate to open twice
        let err = manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_txmax_must_be_redundant() {
        let manager = manager(sysinfo("stmmac"), permissive_runner());

        let mut config = talker(3, 6, 2 * MS, 250_000, 1522);
        config.tx_window_max_ns = Some(250_000 + 12_176);
        manager.add_talker(&config).await.unwrap();

        let mut config = talker(3, 5, 2 * MS, 1_000_000, 1522);
        config.tx_window_max_ns = Some(1_500_000);
        let err = manager.add_talker(&config).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let manager = manager(sysinfo("stmmac"), permissive_runner());

        // 1522 bytes need 12176 ns, more than a 10 us interval
        let err = manager
            .add_talker(&talker(3, 6, 10_000, 0, 1522))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_operational_state_must_be_queryable() {
        let mut sysinfo = MockSystemInfo::new();
        sysinfo
            .expect_driver_name()
            .returning(|_| Ok("stmmac".to_owned()));
        sysinfo
            .expect_is_operational()
            .returning(|_| Err(anyhow!("no such interface")));

        let manager = manager(sysinfo, MockSystemCommandRunner::new());

        let err = manager
            .add_talker(&talker(3, 6, 2 * MS, 250_000, 1522))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }
}
