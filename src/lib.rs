//! nodecore - node agent for namespace sandboxes.
//!
//! The agent builds a root filesystem per container, launches a helper process
//! inside fresh namespaces, attaches virtual NICs and relays commands into the
//! sandbox over a pair of FIFOs.
//!
//! # Platform Requirements
//!
//! - Linux with network, mount, UTS and IPC namespaces
//! - cgroups v2 (unified hierarchy)
//! - iproute2, plus restic and zerotier-one for backups and overlay NICs
//! - root privileges
//!
//! # Example
//!
//! ```no_run
//! use nodecore::{AgentConfig, Manager, capability::Capabilities, server, system};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = AgentConfig::default();
//!     system::check_all(&config.cgroup_root)?;
//!
//!     let caps = Capabilities::host(&config);
//!     server::run(Manager::new(config, caps)).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod container;
pub mod error;
pub mod manager;
pub mod network;
pub mod relay;
pub mod sandbox;
pub mod server;
pub mod system;

// Re-export commonly used types
pub use config::AgentConfig;
pub use error::{Error, ErrorKind, ManagerError, Result};
pub use manager::Manager;
