// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Provides YAML-based session configuration

use super::SessionOptions;
use anyhow::{Context, Result};
use std::io::Read;

/// Read session options from YAML
///
/// Keys that are not given stay unset so they can be filled from other sources.
///
/// ```
/// # use tsn_txrx::configuration::read_yaml;
/// # #[path = "../doctest.rs"]
/// # mod doctest;
/// # let tmpfile = doctest::generate_example_yaml()?;
/// # let filepath = tmpfile.path();
/// # use std::fs::File;
/// let options = read_yaml(File::open(filepath)?)?;
/// assert_eq!(options.queue, Some(3));
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// # Errors
///
/// Will return `Err` if the configuration could not be parsed.
pub fn read_yaml<R: Read>(reader: R) -> Result<SessionOptions> {
    serde_yaml::from_reader(reader).context("Reading YAML file")
}
