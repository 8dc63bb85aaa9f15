// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    long_about = "Builds tracked Go applications across a version matrix inside pinned toolchain containers, reads struct-field offsets out of their debug info, and folds the results into the offset index gotel ships."
)]
#[command(name = "gotel-offsetgen")]
#[command(disable_version_flag = true)]
pub(crate) struct Cli {
    /// Destination of the generated offset index.
    #[clap(long, default_value = "/tmp/offset_results.json")]
    pub(crate) output: PathBuf,

    /// Directory holding the persistent build cache.
    #[clap(long, default_value = "/tmp/gotel-offsetgen")]
    pub(crate) storage: PathBuf,

    /// Number of concurrent build workers. Defaults to the cpu count.
    #[clap(long)]
    pub(crate) workers: Option<usize>,

    /// Log verbosity: 0 warnings, 1 info, 2 debug, 3 trace.
    #[clap(long = "v", default_value_t = 0)]
    pub(crate) verbosity: u8,
}
