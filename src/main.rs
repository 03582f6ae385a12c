//! nodecore - Entry Point
//!
//! Serves the container command surface on stdin/stdout.

use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use nodecore::capability::Capabilities;
use nodecore::network::ensure_default_bridge;
use nodecore::{AgentConfig, Manager, server, system};

/// nodecore - builds, networks and supervises namespace sandboxes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Skip system requirements checks (NOT RECOMMENDED)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Per-container working directories
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Per-container root directories
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Maximum number of live containers
    #[arg(long)]
    max_containers: Option<usize>,

    /// Host path of the in-sandbox helper binary
    #[arg(long)]
    helper: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> AgentConfig {
        let mut config = AgentConfig::default();
        if let Some(dir) = &self.base_dir {
            config = config.with_backend_dir(dir);
        }
        if let Some(dir) = &self.root_dir {
            config = config.with_root_dir(dir);
        }
        if let Some(max) = self.max_containers {
            config = config.with_max_containers(max);
        }
        if let Some(helper) = &self.helper {
            config = config.with_helper_path(helper);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries responses, logs go to stderr
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("nodecore v{}", env!("CARGO_PKG_VERSION"));
    let config = args.config();

    if args.skip_checks {
        warn!("Skipping system requirements checks (--skip-checks). This is NOT recommended!");
    } else {
        info!("Checking system requirements...");

        match system::check_all(&config.cgroup_root) {
            Ok(reqs) => {
                info!(
                    "System requirements satisfied: kernel {}, cgroups v2: {}, tools: {}",
                    reqs.kernel_version,
                    reqs.cgroups_v2,
                    reqs.tools.len()
                );
            }
            Err(e) => {
                error!("System requirements check failed");
                return Err(e).into_diagnostic();
            }
        }
    }

    let caps = Capabilities::host(&config);
    ensure_default_bridge(caps.exec.as_ref(), &config).into_diagnostic()?;
    let manager = Manager::new(config, caps);

    let served = tokio::select! {
        result = server::run(manager.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    let shutdown = manager.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown())
        .await
        .into_diagnostic()?;

    served.into_diagnostic()
}
