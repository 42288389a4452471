//! Core types for ctrl.
//!
//! - [`Error`] / [`Result`]: the single error taxonomy shared by every crate
//! - [`ReconcileKey`]: the deduplication identity of a unit of work
//! - [`Object`]: the dynamic object model carried by events

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod key;
pub mod object;
pub mod result;

pub use error::Error;
pub use key::{NamespacedName, ReconcileKey};
pub use object::{Object, ObjectMeta, OwnerReference};
pub use result::Result;
