// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod classifier;
pub mod clock;
pub mod configuration;
pub mod engine;
pub mod frame;
pub mod scheduler;
pub mod socket;
pub mod umem;
