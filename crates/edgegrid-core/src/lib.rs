//! edgegrid-core — shared data model for the edgegrid control plane.
//!
//! Holds the composite resource keys, the tracked/info/refs objects that
//! live in the store, the traits the store and caches use to handle them
//! generically, and the TOML controller configuration.

pub mod config;
pub mod error;
pub mod object;
pub mod ports;
pub mod types;

pub use config::{ControllerConfig, Timeouts};
pub use error::{CoreError, CoreResult};
pub use object::{InfoObject, NotifyTagged, ObjKey, StoredObject, TrackedObject};
pub use ports::{AppPort, LProto, parse_app_ports};
pub use types::*;
