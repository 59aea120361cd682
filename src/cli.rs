// Copyright 2025 vmssh contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vmssh",
    version,
    about = "Batch SSH routing for cloud VMs with pooled bastion tunnels"
)]
pub struct Cli {
    /// Path to the configuration file (default: ~/.config/vmssh/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve SSH routes for VMs, reporting one line per VM
    Resolve {
        /// VM names from the inventory; empty resolves the whole inventory
        vms: Vec<String>,

        /// Maximum concurrent resolutions
        #[arg(long)]
        parallel: Option<usize>,

        /// Overall deadline for the batch in seconds (0 = unlimited)
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep resolved tunnels open for this many seconds after the
        /// report, so external SSH clients can use them
        #[arg(long)]
        hold: Option<u64>,
    },

    /// List the configured VMs and jump hosts
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_args() {
        let cli = Cli::try_parse_from(["vmssh", "resolve", "web-0", "db-0", "--timeout", "30"])
            .unwrap();
        match cli.command {
            Commands::Resolve { vms, timeout, .. } => {
                assert_eq!(vms, vec!["web-0", "db-0"]);
                assert_eq!(timeout, Some(30));
            }
            other => panic!("expected resolve, got {other:?}"),
        }
    }

    #[test]
    fn test_verbosity_count() {
        let cli = Cli::try_parse_from(["vmssh", "-vv", "list"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
