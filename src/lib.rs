//! User-space driver core for Tenstorrent-style AI-accelerator chips (spec
//! §1): coordinate translation, TLB-backed MMIO, ARC messaging, DMA,
//! Ethernet-tunnelled remote chip access, cluster topology and bring-up, and
//! warm reset orchestration, behind one per-generation architecture table.
//!
//! This crate stops at the boundary the spec draws (§1 non-goals): it does
//! not parse cluster-connectivity YAML, walk sysfs or open kernel driver
//! device nodes, pin hugepages, or ship a command-line front-end. Callers
//! supply those as already-opened resources ([`transport::Transport`],
//! [`device_enum::DeviceEnumerator`], [`cluster::SocDescriptorSource`],
//! [`warm_reset::ResetDriver`]) and this crate supplies the behavior that
//! sits on top of them.
//!
//! The `gen-a`/`gen-b`/`simulation` Cargo features gate which generation
//! tables and transports a downstream crate pulls in; all three are enabled
//! by default.

pub mod arc_messenger;
pub mod arch;
pub mod chip;
pub mod cluster;
pub mod cluster_descriptor;
pub mod config;
pub mod coord;
pub mod device_enum;
pub mod error;
pub mod lock_manager;
pub mod remote;
pub mod signal_safety;
pub mod sysmem;
pub mod tlb;
pub mod tlb_manager;
pub mod transport;
pub mod ttdevice;
pub mod warm_reset;

pub use chip::Chip;
pub use cluster::Cluster;
pub use cluster_descriptor::ClusterDescriptor;
pub use config::DriverConfig;
pub use error::{DriverError, Result};
