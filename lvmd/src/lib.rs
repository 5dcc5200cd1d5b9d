//! lvmd manages LVM volume groups and logical volumes on the node it runs
//! on, on behalf of a CSI driver. It exposes a typed gRPC surface over a
//! Unix domain socket and translates every operation into invocations of
//! the `lvm` command line tool, decoding its JSON reports back into typed
//! state.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod device_class;
pub mod grpc;
pub mod lvm;

#[allow(clippy::derive_partial_eq_without_eq)]
#[allow(clippy::large_enum_variant)]
pub mod proto {
    tonic::include_proto!("lvmd");
}
