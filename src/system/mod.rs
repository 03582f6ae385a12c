//! System requirements validation.
//!
//! This module provides functions to check that the host can run the agent:
//! root privileges, a kernel with network namespaces, cgroups v2 and iproute2.

mod requirements;

pub use requirements::{
    MIN_KERNEL_VERSION, REQUIRED_TOOLS, SystemRequirements, check_all, check_cgroups_v2,
    check_kernel_version, check_root, check_tool,
};
