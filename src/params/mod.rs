//! Device parameter registry and typed value decoding.
//!
//! The device exposes its state as numbered parameters (encoder position,
//! clock, digital I/O, sensor rails). Each parameter identifier maps to a
//! descriptor naming it and declaring its decoded type; *combo* parameters
//! bundle several constituents into one read, concatenated back-to-back in
//! a fixed order that must match the firmware's encoding order exactly —
//! there are no length-prefixed sub-fields on the wire.
//!
//! [`Registry::decode`] is the single entry point: it dispatches on the
//! descriptor's declared type and fails with structured errors on unknown
//! identifiers or mismatched payload lengths (both indicate protocol
//! version skew between host and firmware and are never silently ignored).

mod param_type;
mod registry;
mod value;

pub use param_type::ParamType;
pub use registry::{ParamInfo, Registry, VELOCITY_SIGN};
pub use value::Value;
