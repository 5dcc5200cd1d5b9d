//! The gRPC surface of lvmd: the LV service mutating logical volumes, the
//! VG service observing volume groups and streaming free-space changes,
//! and the Unix domain socket server hosting both.

use tonic::Status;

use crate::{device_class, lvm, proto};

mod lv;
mod notify;
mod server;
mod vg;

pub use lv::LvSvc;
pub use notify::Notifier;
pub use server::LvmdGrpcServer;
pub use vg::VgSvc;

pub(crate) type GrpcResult<T> = Result<tonic::Response<T>, Status>;

impl From<lvm::Error> for Status {
    fn from(e: lvm::Error) -> Self {
        match e {
            lvm::Error::VgNotFound { .. }
            | lvm::Error::LvNotFound { .. }
            | lvm::Error::PoolNotFound { .. } => Status::not_found(e.to_string()),
            lvm::Error::NoSpace { .. } => Status::resource_exhausted(e.to_string()),
            lvm::Error::CannotShrink { .. }
            | lvm::Error::InvalidLvAttr { .. }
            | lvm::Error::UnknownAttrCode { .. }
            | lvm::Error::UnknownAccessType { .. }
            | lvm::Error::SnapshotNonThin { .. } => Status::invalid_argument(e.to_string()),
            _ => Status::internal(e.to_string()),
        }
    }
}

impl From<device_class::Error> for Status {
    fn from(e: device_class::Error) -> Self {
        Status::not_found(e.to_string())
    }
}

/// Convert an observed logical volume into its wire representation,
/// logging volumes whose attributes fail the health verification.
pub(crate) fn proto_volume(lv: lvm::LogicalVolume) -> proto::LogicalVolume {
    if let Err(reason) = lv.attr().verify_health() {
        warn!("logical volume {}: {reason}", lv.full_name());
    }
    proto::LogicalVolume {
        name: lv.name().to_string(),
        size_gb: lv.size() >> 30,
        size_bytes: lv.size() as i64,
        dev_major: lv.dev_major(),
        dev_minor: lv.dev_minor(),
        tags: lv.tags().to_vec(),
        path: lv.path().to_string(),
        attr: lv.attr().to_string(),
    }
}

/// The size of a request in bytes, preferring the signed byte field and
/// falling back to the legacy GiB field.
pub(crate) fn requested_size_bytes(size_bytes: i64, size_gb: u64) -> Result<u64, Status> {
    if size_bytes < 0 {
        return Err(Status::invalid_argument(
            "requested size must not be negative",
        ));
    }
    let size = if size_bytes > 0 {
        size_bytes as u64
    } else {
        size_gb
            .checked_mul(1 << 30)
            .ok_or_else(|| Status::invalid_argument("requested size in GiB overflows bytes"))?
    };
    if size == 0 {
        return Err(Status::invalid_argument("requested size must be positive"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bytes_is_preferred_over_size_gb() {
        assert_eq!(requested_size_bytes(4096, 1).unwrap(), 4096);
    }

    #[test]
    fn size_gb_is_a_fallback() {
        assert_eq!(requested_size_bytes(0, 1).unwrap(), 1 << 30);
        assert_eq!(requested_size_bytes(0, 3).unwrap(), 3 << 30);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert!(requested_size_bytes(-1, 0).is_err());
        assert!(requested_size_bytes(0, 0).is_err());
        assert!(requested_size_bytes(0, u64::MAX).is_err());
    }

    #[test]
    fn lvm_errors_map_to_status_kinds() {
        use tonic::Code;

        let not_found = Status::from(lvm::Error::LvNotFound {
            name: "vg0/v1".to_string(),
        });
        assert_eq!(not_found.code(), Code::NotFound);

        let no_space = Status::from(lvm::Error::NoSpace {
            error: "insufficient free space".to_string(),
        });
        assert_eq!(no_space.code(), Code::ResourceExhausted);

        let shrink = Status::from(lvm::Error::CannotShrink {
            name: "vg0/v1".to_string(),
            current: 2,
            requested: 1,
        });
        assert_eq!(shrink.code(), Code::InvalidArgument);

        let internal = Status::from(lvm::Error::JsonParsing {
            command: "vgs".to_string(),
            error: "unexpected end of input".to_string(),
        });
        assert_eq!(internal.code(), Code::Internal);
    }
}
