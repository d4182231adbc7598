//! Jiva CSI plugin.
//!
//! Implementation of gRPC methods from the CSI spec for iSCSI backed Jiva
//! volumes. The controller side manages the `JivaVolume` custom resources
//! which are reconciled by the jiva operator; the node side waits for those
//! volumes to become ready, logs in to their iSCSI targets and mounts them.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate tracing;

#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
#[allow(clippy::enum_variant_names)]
#[allow(clippy::upper_case_acronyms)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// Build a `tonic::Status` and log its message on the way out.
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); tonic::Status::new(tonic::Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); tonic::Status::new(tonic::Code::$code, message) }};
}

/// Command line and process wide configuration.
pub mod config;
pub mod controller;
pub mod dev;
pub mod error;
mod filesystem_vol;
mod format;
pub mod identity;
pub mod limiter;
pub mod mount;
pub mod node;
/// Shutdown event which lets the plugin know it needs to stop processing new
/// events and complete any existing ones before shutting down.
pub mod shutdown_event;
pub mod store;
pub mod volume;
pub mod wait;

use csi::volume_capability::{access_mode::Mode, AccessMode};

/// The only access mode jiva volumes can be consumed with.
pub(crate) const SUPPORTED_ACCESS_MODE: Mode = Mode::SingleNodeWriter;

/// Check that the access mode of a capability is one we support.
pub(crate) fn is_supported_access_mode(mode: &Option<AccessMode>) -> bool {
    match mode {
        Some(access) => matches!(
            Mode::try_from(access.mode),
            Ok(mode) if mode == SUPPORTED_ACCESS_MODE
        ),
        None => false,
    }
}
