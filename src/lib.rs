// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod configuration;
pub mod device;
pub mod error;
pub mod manager;
pub mod mapping;
pub mod scheduler;
pub mod service;
pub mod sysconf;
pub mod sysinfo;
