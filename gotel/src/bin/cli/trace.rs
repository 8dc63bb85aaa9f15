// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::sync::Arc;

use anyhow::{anyhow, bail};
use comfy_table::Table;
use gotel::{
    OffsetIndex, ProbeManager, ProbeState, TargetSelector,
    host::{discovery::ProcfsDiscovery, kernel::AyaKernelApi, otlp::OtlpSpanSink},
    probe,
    utils::{env_flag, initialize_gotel, open_config_file},
};
use log::info;
use tokio::signal::ctrl_c;

use crate::args::TraceArgs;

pub(crate) async fn execute_trace(args: &TraceArgs) -> Result<(), anyhow::Error> {
    initialize_gotel()?;

    let selector = match (args.pid, &args.exe) {
        (Some(pid), _) => TargetSelector::Pid(pid),
        (None, Some(exe)) => TargetSelector::ExeName(exe.clone()),
        (None, None) => bail!("one of --pid or --exe is required"),
    };

    let mut config = open_config_file();
    config.set_verifier_log(env_flag("SHOW_VERIFIER_LOG"));
    let export = config.export();
    let endpoint = args.endpoint.as_deref().unwrap_or(&export.endpoint);

    let index = Arc::new(OffsetIndex::bundled().map_err(|e| anyhow!("offset index: {e}"))?);
    let sink = OtlpSpanSink::new(endpoint, &export.service_name)?;

    let mut manager = ProbeManager::new(
        config,
        index,
        Box::new(AyaKernelApi::new()),
        Arc::new(sink),
        probe::registry(),
    );

    let details = manager.analyze_target(&ProcfsDiscovery, &selector)?;
    let result = manager.start(&details).await;
    print_statuses(&manager);
    if let Err(e) = result {
        manager.shutdown().await;
        return Err(e.into());
    }

    info!("tracing pid {}, ctrl-c to stop", details.pid);
    ctrl_c().await?;

    manager.shutdown().await;
    OtlpSpanSink::shutdown();
    Ok(())
}

fn print_statuses(manager: &ProbeManager) {
    let mut table = Table::new();
    table.set_header(vec!["Library", "State", "Detail"]);
    for status in manager.statuses() {
        match &status.state {
            ProbeState::Loaded { breakpoints } => {
                table.add_row(vec![
                    status.library.clone(),
                    "loaded".to_string(),
                    format!("{breakpoints} breakpoints"),
                ]);
            }
            ProbeState::Disabled { reason } => {
                table.add_row(vec![
                    status.library.clone(),
                    "disabled".to_string(),
                    reason.clone(),
                ]);
            }
        }
    }
    println!("{table}");
}
