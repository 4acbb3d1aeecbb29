//! Custom Resource Definitions for the EMQX operator
//!
//! This module defines the `EMQX` CRD and the types shared with the controller.

mod emqx;
pub mod types;


pub use emqx::{Emqx, EmqxSpec, EmqxStatus, SpecValidationError, DEFAULT_CORE_REPLICAS};
pub use types::*;
