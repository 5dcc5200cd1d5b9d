//! Logical Volume Manager (LVM) is a device mapper framework that provides
//! logical volume management for the Linux kernel. lvmd drives it through
//! the lvm command line tool:
//!  - VG (Volume Group) is a collection of physical volumes used as a
//!    store to provision volumes. Observed with `vgs`; volume groups are
//!    provisioned by the operator and never created or destroyed here.
//!  - LV (Logical Volume) is a block device carved out of a VG. Managed
//!    with `lvcreate`, `lvchange`, `lvresize`, `lvremove`, `lvrename` and
//!    observed with `lvs`.
//!  - A thin pool is a special LV that allocates storage on demand to its
//!    thin members; its free space is synthesized here from the configured
//!    overprovision ratio, since lvm does not report it natively.
//!
//! All report output is requested as json in bytes without suffixes and
//! decoded into typed rows; mutations are followed by a fresh observation
//! because lvm rounds sizes to the extent size.

/// Helps run LVM commands and decode their json output and reports.
mod cli;
mod error;
/// Logical volume and thin pool management.
mod lv;
/// Parsing of the lv_attr attribute string.
mod lv_attr;
/// Volume group observation.
mod vg;

/// Errors encountered whilst interacting with the LVM module.
pub use error::Error;

pub use cli::set_containerized;
pub use lv::{AccessType, LogicalVolume, ThinPool, ThinPoolUsage};
pub use lv_attr::{
    AllocationPolicy, LvAttr, Minor, Open, OpenTarget, Permissions, SkipActivation, State,
    VolumeHealth, VolumeType,
};
pub use vg::VolumeGroup;
