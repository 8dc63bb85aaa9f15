// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use comfy_table::Table;
use gotel::{
    CallingConvention,
    probe::{self, Probe as _},
};

pub(crate) fn execute_probes() -> Result<(), anyhow::Error> {
    let mut table = Table::new();
    table.set_header(vec!["Library", "Object", "Functions", "Mandatory"]);
    for probe in probe::registry() {
        let functions = probe
            .functions()
            .iter()
            .map(|f| f.symbol)
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(vec![
            probe.library_name().to_string(),
            probe.object_file(CallingConvention::Registers),
            functions,
            probe.mandatory().to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
