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

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

use vmssh::{
    cli::{Cli, Commands},
    config::Config,
    directory::StaticDirectory,
    routing::{ResolveOptions, RouteDetector, RouteResult, RouteVia, RoutingResolver},
    security::AuthorizedScope,
    tunnel::{ConnectionPool, ProcessLauncher},
    utils::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    let exit_code = match cli.command {
        Commands::List => {
            list_inventory(&config);
            0
        }
        Commands::Resolve {
            vms,
            parallel,
            timeout,
            hold,
        } => run_resolve(&config, &vms, parallel, timeout, hold).await?,
    };

    std::process::exit(exit_code);
}

fn list_inventory(config: &Config) {
    println!("VMs:");
    for vm in config.inventory() {
        let reach = match &vm.public_address {
            Some(addr) => format!("public {addr}"),
            None => format!("private (network {})", vm.network),
        };
        println!("  {} - {} [{}]", vm.name, vm.resource_id, reach);
    }
    println!("Jump hosts:");
    for jh in &config.jump_hosts {
        println!(
            "  {} - networks: {} ({})",
            jh.id,
            jh.networks.join(", "),
            if jh.supports_tunneling() {
                "tunneling"
            } else {
                "no tunneling"
            }
        );
    }
}

async fn run_resolve(
    config: &Config,
    names: &[String],
    parallel: Option<usize>,
    timeout: Option<u64>,
    hold: Option<u64>,
) -> Result<i32> {
    let vms = config.select_vms(names)?;

    let launcher = Arc::new(ProcessLauncher::new(config.tunnel_program()));
    let pool = Arc::new(ConnectionPool::new(
        launcher,
        AuthorizedScope::new(config.scope.clone()),
        config.pool_config(),
    ));
    let directory = Arc::new(StaticDirectory::new(config.jump_hosts.clone()));
    let detector = RouteDetector::new(directory, config.disambiguation_policy());
    let resolver = RoutingResolver::new(detector, Arc::clone(&pool));

    let deadline = timeout
        .or(config.defaults.timeout)
        .filter(|&t| t > 0)
        .map(Duration::from_secs);
    let options = ResolveOptions {
        max_parallel: parallel.or(config.defaults.parallel).unwrap_or(16),
        deadline,
    };

    // Ctrl-C during resolution drains the pool before exiting; the pool is
    // the sole owner of every tunnel subprocess, so this is the last-resort
    // termination guarantee.
    let outcomes = tokio::select! {
        outcomes = resolver.resolve(&vms, &options) => outcomes,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, closing tunnels");
            pool.shutdown_all().await;
            anyhow::bail!("interrupted");
        }
    };

    let mut unreachable = 0usize;
    let mut failed = 0usize;
    let mut leases = Vec::new();

    for outcome in outcomes {
        match outcome.result {
            RouteResult::Reachable(route) => {
                let via = match &route.via {
                    RouteVia::Direct => "direct".to_string(),
                    RouteVia::Bastion { jump_host_id } => format!("bastion {jump_host_id}"),
                };
                println!(
                    "{}: {} via {} at {}",
                    outcome.vm.name,
                    "reachable".green(),
                    via,
                    route.endpoint
                );
                if let Some(lease) = route.lease {
                    leases.push(lease);
                }
            }
            RouteResult::Unreachable { reason } => {
                unreachable += 1;
                println!("{}: {} - {}", outcome.vm.name, "unreachable".red(), reason);
            }
            RouteResult::Failed(e) => {
                failed += 1;
                println!("{}: {} - {}", outcome.vm.name, "FAILED".red().bold(), e);
            }
        }
    }

    if let Some(secs) = hold.filter(|&s| s > 0) {
        if !leases.is_empty() {
            eprintln!("holding {} tunnels for {secs}s (Ctrl-C to stop)", leases.len());
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    for lease in leases {
        pool.checkin(lease).await;
    }
    pool.shutdown_all().await;

    Ok(if failed > 0 {
        2
    } else if unreachable > 0 {
        1
    } else {
        0
    })
}
