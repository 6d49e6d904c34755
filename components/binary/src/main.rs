// Copyright 2024 dxram-rs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod cmd;
mod config;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use snafu::Whatever;
use tracing::info;

use crate::{
    cmd::{heap::HeapArgs, simulate::SimulateArgs},
    config::NodeConfig,
};

const LOGGING_OPTIONS_HEADER: &str = "LOGGING";

#[derive(Debug, Parser)]
#[command(name = "dxram", about = "dxram heap and lookup overlay driver", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Clone, Args)]
struct GlobalArgs {
    #[arg(long, global = true, value_name = "FILE", help = "TOML file with [heap], [lookup] and [logging] tables")]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        value_name = "LEVEL",
        help = "Log level, overridden by RUST_LOG",
        help_heading = LOGGING_OPTIONS_HEADER,
    )]
    log_level: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DIRECTORY",
        help = "Also write a daily log file to this directory",
        help_heading = LOGGING_OPTIONS_HEADER,
    )]
    log_dir: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a random allocation workload against a heap.
    Heap(HeapArgs),
    /// Run an in-process overlay and exercise the lookup directory.
    Simulate(SimulateArgs),
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.global.config.as_deref())?;
    if let Some(level) = cli.global.log_level {
        config.logging.level = level;
    }
    if cli.global.log_dir.is_some() {
        config.logging.dir = cli.global.log_dir;
    }
    let _guards = dxram_utils::logger::init_global_logging(dxram_common::DXRAM, &config.logging)?;
    info!("dxram {} started", env!("CARGO_PKG_VERSION"));

    match cli.commands {
        Commands::Heap(args) => args.run(config.heap),
        Commands::Simulate(args) => args.run(config.lookup),
    }
}
