//! Sandbox construction and isolated process launch.
//!
//! [`SandboxBuilder`] prepares a container's root directory on the host;
//! [`Launcher`] starts the helper inside it under fresh namespaces.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use nodecore::AgentConfig;
//! use nodecore::capability::Capabilities;
//! use nodecore::container::ContainerArgs;
//! use nodecore::sandbox::SandboxBuilder;
//!
//! let config = AgentConfig::default();
//! let caps = Capabilities::host(&config);
//! let args = ContainerArgs {
//!     root: "file:///srv/images/base".into(),
//!     ..ContainerArgs::default()
//! };
//!
//! let builder = SandboxBuilder::new(1, config.container_root(1), &caps);
//! builder.build(&args, Path::new("/usr/sbin/corex"), "coreX").unwrap();
//! builder.cleanup().unwrap();
//! ```

mod builder;
mod launcher;
mod mounts;

pub use builder::SandboxBuilder;
pub use launcher::{GuestBind, HakoniwaLauncher, IsolatedProcess, LaunchSpec, Launcher};
pub use mounts::{HostMounter, Mounter, ensure_mount_point, guest_path, unmount_all};
