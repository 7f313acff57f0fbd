//! Network-namespace testbed for privileged netlab integration tests.
//!
//! Builds the three-host layout netlab runs on (source, controller, sink)
//! out of Linux network namespaces and veth pairs, so the real `tc`, `ip`,
//! `ping` and `tcpdump` can be exercised without touching the host's own
//! interfaces.
//!
//! # Modules
//!
//! - [`topology`]: namespaces, veth links and the three-host [`Testbed`]
//! - [`test_util`]: privilege and tool checks, unique name generation

pub mod test_util;
pub mod topology;

pub use test_util::{check_privileges, has_tool, unique_ns_name};
pub use topology::{Namespace, Testbed};
