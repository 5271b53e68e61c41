//! Shared types for the OpenList storage engine
//!
//! This crate holds the boundary contracts between the plugin runtime and the
//! layers around it: the object model, the [`Driver`] trait every storage
//! backend implements, the [`FileStreamer`] upload contract, hash utilities,
//! and the persisted plugin metadata.

pub mod driver;
pub mod error;
pub mod hash;
pub mod object;
pub mod path;
pub mod plugin;
pub mod stream;

pub use driver::{
    Additional, Capability, Driver, DriverProps, DriverStatus, FieldKind, FormField,
    UpdateProgress,
};
pub use error::{DriverError, DriverResult};
pub use hash::{HashAlg, HashInfo, MultiHasher};
pub use object::Object;
pub use path::fix_and_clean_path;
pub use plugin::{PluginManifest, PluginRecord, PluginStatus};
pub use stream::{FileStreamer, Link, LinkArgs, RangeReader};
