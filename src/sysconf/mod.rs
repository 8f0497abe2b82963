// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Transactional system configuration
//!
//! An admission changes kernel state in several steps (device features,
//! qdisc, VLAN link). The [`Effector`] executes an ordered list of
//! [`Action`]s and guarantees that after a failure the already-applied
//! prefix has been undone in reverse order, using values snapshotted
//! immediately before each change. Only when an undo itself fails does the
//! effector report [`AdmissionError::EffectorFatal`], upon which the caller
//! must quarantine the interface.
//!
//! The actual `tc`/`ip`/`ethtool` invocations sit behind the
//! [`SystemCommandRunner`] trait so that tests can observe and fail
//! individual steps.

use crate::error::AdmissionError;
use crate::mapping::PRIORITY_MAP_LEN;
use crate::scheduler::GateControlEntry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error};
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

mod commands;
pub use commands::ShellCommandRunner;

/// taprio flags value selecting full hardware offload
pub const TAPRIO_FLAGS_FULL_OFFLOAD: u32 = 0x2;

/// Everything needed to build one taprio qdisc configuration
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TaprioSpec {
    /// Number of traffic classes
    pub num_tc: u8,

    /// 16-entry socket priority to traffic class table
    pub priority_map: [u8; PRIORITY_MAP_LEN],

    /// Queue ranges per traffic class as `(count, offset)`
    pub queues: Vec<(u16, u16)>,

    /// Absolute start of the first cycle, in TAI nanoseconds
    pub base_time_ns: u64,

    /// The gate-control list
    pub entries: Vec<GateControlEntry>,
}

/// Everything needed to create one VLAN sub-interface
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VlanSpec {
    /// Parent (physical) interface
    pub parent: String,

    /// VLAN identifier
    pub vid: u16,

    /// Egress priority to PCP map
    pub egress: Vec<(u8, u8)>,
}

impl VlanSpec {
    /// Name of the sub-interface, `<parent>.<vid>`
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.parent, self.vid)
    }
}

/// Executes single system configuration commands
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SystemCommandRunner {
    /// Whether Energy-Efficient Ethernet is currently enabled
    async fn eee_enabled(&self, interface: &str) -> Result<bool>;

    /// Switch Energy-Efficient Ethernet on or off
    async fn set_eee(&self, interface: &str, enable: bool) -> Result<()>;

    /// Whether the given ethtool feature is currently enabled
    async fn feature_enabled(&self, interface: &str, feature: &str) -> Result<bool>;

    /// Switch an ethtool feature on or off
    async fn set_feature(&self, interface: &str, feature: &str, enable: bool) -> Result<()>;

    /// Current Tx/Rx descriptor ring sizes
    async fn ring_sizes(&self, interface: &str) -> Result<(u32, u32)>;

    /// Configure Tx/Rx descriptor ring sizes
    async fn set_ring_sizes(&self, interface: &str, tx: u32, rx: u32) -> Result<()>;

    /// Replace the root qdisc with the given taprio configuration
    async fn replace_taprio(&self, interface: &str, spec: &TaprioSpec) -> Result<()>;

    /// Delete the root qdisc, falling back to the kernel default
    async fn delete_root_qdisc(&self, interface: &str) -> Result<()>;

    /// Create a VLAN sub-interface with its egress map
    async fn add_vlan(&self, spec: &VlanSpec) -> Result<()>;

    /// Delete a VLAN sub-interface
    async fn delete_vlan(&self, name: &str) -> Result<()>;
}

/// One reversible kernel-state change
#[derive(Debug, Clone)]
pub enum Action {
    /// Switch Energy-Efficient Ethernet
    SetEee {
        /// Interface to configure
        interface: String,
        /// Target state
        enable: bool,
    },

    /// Switch an ethtool feature
    SetFeature {
        /// Interface to configure
        interface: String,
        /// ethtool feature name
        feature: String,
        /// Target state
        enable: bool,
    },

    /// Configure descriptor ring sizes
    SetRingSizes {
        /// Interface to configure
        interface: String,
        /// Tx ring entries
        tx: u32,
        /// Rx ring entries
        rx: u32,
    },

    /// Replace the root qdisc with a taprio configuration
    ReplaceQdisc {
        /// Interface to configure
        interface: String,
        /// The new configuration
        spec: TaprioSpec,
        /// The committed configuration to restore on undo; None deletes
        /// the root qdisc instead
        prior: Option<TaprioSpec>,
    },

    /// Create a VLAN sub-interface
    AddVlan {
        /// The sub-interface to create
        spec: VlanSpec,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetEee { interface, enable } => {
                write!(f, "set EEE {} on {interface}", on_off(*enable))
            }
            Self::SetFeature {
                interface,
                feature,
                enable,
            } => write!(f, "set feature {feature} {} on {interface}", on_off(*enable)),
            Self::SetRingSizes { interface, tx, rx } => {
                write!(f, "set ring sizes tx {tx} rx {rx} on {interface}")
            }
            Self::ReplaceQdisc { interface, .. } => {
                write!(f, "replace root qdisc on {interface}")
            }
            Self::AddVlan { spec } => write!(f, "add VLAN link {}", spec.name()),
        }
    }
}

const fn on_off(enable: bool) -> &'static str {
    if enable {
        "on"
    } else {
        "off"
    }
}

/// Undo record for one applied action, carrying the pre-change snapshot
#[derive(Debug, Clone)]
enum Undo {
    RestoreEee { interface: String, enable: bool },
    RestoreFeature {
        interface: String,
        feature: String,
        enable: bool,
    },
    RestoreRingSizes { interface: String, tx: u32, rx: u32 },
    RestoreQdisc {
        interface: String,
        prior: Option<TaprioSpec>,
    },
    DeleteVlan { name: String },
}

/// Applies action lists transactionally
#[derive(Clone)]
pub struct Effector {
    runner: Arc<dyn SystemCommandRunner + Send + Sync>,
}

impl Effector {
    /// Create an effector executing commands through the given runner
    pub fn new(runner: Arc<dyn SystemCommandRunner + Send + Sync>) -> Self {
        Self { runner }
    }

    /// Apply the actions in order, rolling back on the first failure
    ///
    /// # Errors
    ///
    /// [`AdmissionError::EffectorTransient`] if an action failed and the
    /// applied prefix was rolled back completely;
    /// [`AdmissionError::EffectorFatal`] if rolling back failed as well.
    pub async fn apply(&self, actions: Vec<Action>) -> Result<(), AdmissionError> {
        let mut undos: Vec<Undo> = Vec::with_capacity(actions.len());

        for action in actions {
            debug!("Applying: {action}");
            match self.apply_one(&action).await {
                Ok(undo) => undos.push(undo),
                Err(err) => {
                    error!("Failed to {action}: {err:#}");
                    self.rollback(undos).await?;
                    return Err(AdmissionError::EffectorTransient(format!(
                        "{action}: {err:#}"
                    )));
                }
            }
        }

        Ok(())
    }

    async fn rollback(&self, undos: Vec<Undo>) -> Result<(), AdmissionError> {
        for undo in undos.into_iter().rev() {
            if let Err(err) = self.undo_one(&undo).await {
                error!("Rollback step failed, system state is inconsistent: {err:#}");
                return Err(AdmissionError::EffectorFatal(format!("{err:#}")));
            }
        }

        Ok(())
    }

    /// Snapshot the prior state, perform the change, return the undo record
    async fn apply_one(&self, action: &Action) -> Result<Undo> {
        match action {
            Action::SetEee { interface, enable } => {
                let prior = self
                    .runner
                    .eee_enabled(interface)
                    .await
                    .context("Snapshotting EEE state")?;
                self.runner.set_eee(interface, *enable).await?;
                Ok(Undo::RestoreEee {
                    interface: interface.clone(),
                    enable: prior,
                })
            }
            Action::SetFeature {
                interface,
                feature,
                enable,
            } => {
                let prior = self
                    .runner
                    .feature_enabled(interface, feature)
                    .await
                    .with_context(|| format!("Snapshotting feature {feature}"))?;
                self.runner.set_feature(interface, feature, *enable).await?;
                Ok(Undo::RestoreFeature {
                    interface: interface.clone(),
                    feature: feature.clone(),
                    enable: prior,
                })
            }
            Action::SetRingSizes { interface, tx, rx } => {
                let (prior_tx, prior_rx) = self
                    .runner
                    .ring_sizes(interface)
                    .await
                    .context("Snapshotting ring sizes")?;
                self.runner.set_ring_sizes(interface, *tx, *rx).await?;
                Ok(Undo::RestoreRingSizes {
                    interface: interface.clone(),
                    tx: prior_tx,
                    rx: prior_rx,
                })
            }
            Action::ReplaceQdisc {
                interface,
                spec,
                prior,
            } => {
                self.runner.replace_taprio(interface, spec).await?;
                Ok(Undo::RestoreQdisc {
                    interface: interface.clone(),
                    prior: prior.clone(),
                })
            }
            Action::AddVlan { spec } => {
                self.runner.add_vlan(spec).await?;
                Ok(Undo::DeleteVlan { name: spec.name() })
            }
        }
    }

    async fn undo_one(&self, undo: &Undo) -> Result<()> {
        match undo {
            Undo::RestoreEee { interface, enable } => {
                self.runner.set_eee(interface, *enable).await
            }
            Undo::RestoreFeature {
                interface,
                feature,
                enable,
            } => self.runner.set_feature(interface, feature, *enable).await,
            Undo::RestoreRingSizes { interface, tx, rx } => {
                self.runner.set_ring_sizes(interface, *tx, *rx).await
            }
            Undo::RestoreQdisc { interface, prior } => match prior {
                Some(spec) => self.runner.replace_taprio(interface, spec).await,
                None => self.runner.delete_root_qdisc(interface).await,
            },
            Undo::DeleteVlan { name } => self.runner.delete_vlan(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::GateOperation;
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn taprio_spec() -> TaprioSpec {
        let mut priority_map = [0u8; PRIORITY_MAP_LEN];
        priority_map[7] = 1;
        TaprioSpec {
            num_tc: 2,
            priority_map,
            queues: vec![(1, 0), (1, 7)],
            base_time_ns: 4_000_000,
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

    fn vlan_spec() -> VlanSpec {
        VlanSpec {
            parent: "eth0".to_owned(),
            vid: 3,
            egress: vec![(0, 0), (7, 6)],
        }
    }

    fn full_action_list() -> Vec<Action> {
        vec![
            Action::SetEee {
                interface: "eth0".to_owned(),
                enable: false,
            },
            Action::SetFeature {
                interface: "eth0".to_owned(),
                feature: "rx-vlan-offload".to_owned(),
                enable: false,
            },
            Action::ReplaceQdisc {
                interface: "eth0".to_owned(),
                spec: taprio_spec(),
                prior: None,
            },
            Action::AddVlan { spec: vlan_spec() },
        ]
    }

    #[tokio::test]
    async fn test_apply_happy_snapshots_before_change() {
        let mut runner = MockSystemCommandRunner::new();
        let mut seq = Sequence::new();

        runner
            .expect_eee_enabled()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        runner
            .expect_set_eee()
            .with(eq("eth0"), eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        runner
            .expect_feature_enabled()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        runner
            .expect_set_feature()
            .with(eq("eth0"), eq("rx-vlan-offload"), eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        runner
            .expect_replace_taprio()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        runner
            .expect_add_vlan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let effector = Effector::new(Arc::new(runner));
        effector.apply(full_action_list()).await.unwrap();
    }

    #[tokio::test]
    async fn test_vlan_failure_rolls_back_in_reverse_order() {
        let mut runner = MockSystemCommandRunner::new();

        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_feature_enabled().returning(|_, _| Ok(true));
        runner.expect_replace_taprio().returning(|_, _| Ok(()));
        runner
            .expect_add_vlan()
            .returning(|_| Err(anyhow!("RTNETLINK answers: File exists")));

        let mut seq = Sequence::new();
        runner
            .expect_set_eee()
            .with(eq("eth0"), eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        runner
            .expect_set_feature()
            .with(eq("eth0"), eq("rx-vlan-offload"), eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        // rollback starts with the qdisc, then the feature, then EEE
        runner
            .expect_delete_root_qdisc()
            .with(eq("eth0"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_set_feature()
            .with(eq("eth0"), eq("rx-vlan-offload"), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        runner
            .expect_set_eee()
            .with(eq("eth0"), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let effector = Effector::new(Arc::new(runner));
        let err = effector.apply(full_action_list()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorTransient(_)));
    }

    #[tokio::test]
    async fn test_qdisc_undo_restores_prior_spec() {
        let prior = taprio_spec();
        let mut runner = MockSystemCommandRunner::new();

        runner.expect_replace_taprio().times(1).returning(|_, _| Ok(()));
        runner
            .expect_add_vlan()
            .returning(|_| Err(anyhow!("injected")));

        let expected = prior.clone();
        runner
            .expect_replace_taprio()
            .withf(move |interface, spec| interface == "eth0" && *spec == expected)
            .times(1)
            .returning(|_, _| Ok(()));
        runner.expect_delete_root_qdisc().never();

        let mut replacement = taprio_spec();
        replacement.num_tc = 3;

        let actions = vec![
            Action::ReplaceQdisc {
                interface: "eth0".to_owned(),
                spec: replacement,
                prior: Some(prior),
            },
            Action::AddVlan { spec: vlan_spec() },
        ];

        let effector = Effector::new(Arc::new(runner));
        let err = effector.apply(actions).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorTransient(_)));
    }

    #[tokio::test]
    async fn test_failed_undo_is_fatal() {
        let mut runner = MockSystemCommandRunner::new();

        runner.expect_eee_enabled().returning(|_| Ok(true));
        runner.expect_set_eee().with(eq("eth0"), eq(false)).returning(|_, _| Ok(()));
        runner
            .expect_replace_taprio()
            .returning(|_, _| Err(anyhow!("injected")));
        runner
            .expect_set_eee()
            .with(eq("eth0"), eq(true))
            .returning(|_, _| Err(anyhow!("device gone")));

        let actions = vec![
            Action::SetEee {
                interface: "eth0".to_owned(),
                enable: false,
            },
            Action::ReplaceQdisc {
                interface: "eth0".to_owned(),
                spec: taprio_spec(),
                prior: None,
            },
        ];

        let effector = Effector::new(Arc::new(runner));
        let err = effector.apply(actions).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorFatal(_)));
    }

    #[tokio::test]
    async fn test_snapshot_failure_needs_no_rollback_of_itself() {
        let mut runner = MockSystemCommandRunner::new();

        runner
            .expect_eee_enabled()
            .returning(|_| Err(anyhow!("no EEE support")));
        runner.expect_set_eee().never();

        let actions = vec![Action::SetEee {
            interface: "eth0".to_owned(),
            enable: false,
        }];

        let effector = Effector::new(Arc::new(runner));
        let err = effector.apply(actions).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EffectorTransient(_)));
    }
}
