//! Vendor implementations for the key pool.
//!
//! Each vendor contributes a selection policy, a liveness checker and a
//! request adapter. Network IO goes through `UpstreamClient`; this crate never
//! opens sockets itself.

mod auth_extractor;
pub mod classify;
mod error;
mod registry;
pub mod signing;
pub mod tokens;
mod vendor;
pub mod vendors;

pub use classify::{Classification, ErrorAction, KeyEffect, VendorError, classify, parse_vendor_error};
pub use error::{PrepareError, SigningError};
pub use registry::{VendorRegistry, check_schedule};
pub use tokens::{count_prompt_tokens, count_text_tokens, prompt_text, requested_output_tokens};
pub use vendor::{PrepareContext, StreamFraming, VendorAdapter};
