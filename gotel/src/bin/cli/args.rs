// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    long_about = "A zero-code tracer for running Go binaries: attaches eBPF probes to an already-running process and ships OTLP spans."
)]
#[command(name = "gotel")]
#[command(disable_version_flag = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Attach probes to a running Go process and stream spans until
    /// interrupted.
    Trace(TraceArgs),
    /// List the registered probes and the functions they instrument.
    Probes,
}

#[derive(Args, Debug)]
pub(crate) struct TraceArgs {
    /// PID of the target process.
    /// Example: --pid 4711
    #[clap(short, long, verbatim_doc_comment, conflicts_with = "exe")]
    pub(crate) pid: Option<i32>,

    /// Executable name to search the process table for.
    /// Example: --exe checkout-service
    #[clap(short, long, verbatim_doc_comment)]
    pub(crate) exe: Option<String>,

    /// Optional: OTLP gRPC endpoint, overriding the config file.
    /// Example: --endpoint http://collector:4317
    #[clap(long, verbatim_doc_comment)]
    pub(crate) endpoint: Option<String>,
}
