//! # propsync-core
//!
//! Property replication between one master process and its slaves.
//!
//! This crate provides:
//! - Typed properties with server and client roles
//! - Change and message subscriptions
//! - The POSIX shared segment and its compatibility fingerprint
//! - The property registry and its master/slave links
//! - Configuration loading

pub mod config;
pub mod error;
pub mod flags;
mod link;
pub mod property;
pub mod registry;
pub mod segment;
pub mod signal;
pub mod value;

pub use config::{Config, ConfigError, ProcessRole};
pub use error::{PropertyError, RegistryError, SegmentError};
pub use flags::PropertyFlags;
pub use property::{Client, Property, Role, Server, SetBehavior};
pub use registry::{Declarations, Registry};
pub use segment::{Fingerprint, Layout};
pub use signal::Subscription;
pub use value::PropertyValue;
