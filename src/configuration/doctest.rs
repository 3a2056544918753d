// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Only for writing convenient doctests

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

pub fn generate_example_yaml() -> Result<NamedTempFile> {
    use std::io::BufWriter;
    use std::io::Write;

    let file = NamedTempFile::new().context("Unable to create named temporary file")?;

    {
        let mut f = BufWriter::new(&file);
        let data = concat!(
            "interface: eth0\n",
            "mode: transmit\n",
            "queue: 3\n",
            "cycle_time_ns: 1000000\n",
            "destination: 01:1b:19:00:00:00\n",
            "launch_time: true\n"
        );
        f.write_all(data.as_bytes()).context("Unable to write data")?;
        f.flush().context("Flush failed")?;
    }

    Ok(file)
}
