//! The `Driver` trait and its configuration surface

use crate::error::DriverResult;
use crate::object::Object;
use crate::stream::{FileStreamer, Link, LinkArgs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

bitflags::bitflags! {
    /// The set of optional operations a driver claims to implement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capability: u32 {
        const GET    = 1 << 0;
        const LIST   = 1 << 1;
        const LINK   = 1 << 2;
        const MKDIR  = 1 << 3;
        const RENAME = 1 << 4;
        const MOVE   = 1 << 5;
        const REMOVE = 1 << 6;
        const COPY   = 1 << 7;
        const UPLOAD = 1 << 8;
    }
}

/// Static properties a driver reports about itself.
#[derive(Debug, Clone)]
pub struct DriverProps {
    pub name: String,
    pub only_proxy: bool,
    pub no_cache: bool,
    pub alert: String,
    pub no_overwrite_upload: bool,
    pub proxy_range: bool,
    pub capabilities: Capability,
}

/// UI hint for one configuration field of a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub help: String,
}

/// Input widget kind; the payload is the default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "default", rename_all = "snake_case")]
pub enum FieldKind {
    String(String),
    Password(String),
    Number(f64),
    Boolean(bool),
    Text(String),
    Select(Vec<String>),
}

/// The user-supplied configuration blob plus the form schema that describes
/// it. `json` is opaque to the host; only the driver interprets it.
#[derive(Debug, Clone, Default)]
pub struct Additional {
    pub json: Vec<u8>,
    pub forms: Vec<FormField>,
}

/// Operational status of one configured storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverStatus {
    Work,
    /// The driver refuses further calls until an operator resets it.
    NoWork(String),
}

impl DriverStatus {
    pub fn is_work(&self) -> bool {
        matches!(self, DriverStatus::Work)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverStatus::Work => write!(f, "work"),
            DriverStatus::NoWork(msg) => write!(f, "nowork:{msg}"),
        }
    }
}

/// Callback reporting upload progress as a fraction in `[0, 1]`.
pub type UpdateProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// A storage backend exposing a uniform object-store interface.
///
/// Operations take the ambient [`CancellationToken`] of the calling request;
/// a driver observes cancellation cooperatively and may return early with an
/// error once the token fires.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Current driver properties. Implementations may refresh internal state;
    /// on failure they return the last known value.
    async fn config(&self) -> DriverProps;

    /// Current configuration blob and form schema.
    async fn addition(&self) -> Additional;

    async fn init(&self, ctx: &CancellationToken) -> DriverResult<()>;

    async fn drop(&self, ctx: &CancellationToken) -> DriverResult<()>;

    async fn get_root(&self, ctx: &CancellationToken) -> DriverResult<Object>;

    async fn get(&self, ctx: &CancellationToken, path: &str) -> DriverResult<Object>;

    async fn list(&self, ctx: &CancellationToken, dir: &Object) -> DriverResult<Vec<Object>>;

    /// Resolve a download link for `file`. The driver may rewrite `file` in
    /// place when the backend reveals more accurate metadata.
    async fn link(
        &self,
        ctx: &CancellationToken,
        file: &mut Object,
        args: LinkArgs,
    ) -> DriverResult<Link>;

    async fn make_dir(
        &self,
        ctx: &CancellationToken,
        parent: &Object,
        name: &str,
    ) -> DriverResult<Option<Object>>;

    async fn rename(
        &self,
        ctx: &CancellationToken,
        obj: &Object,
        new_name: &str,
    ) -> DriverResult<Option<Object>>;

    async fn move_to(
        &self,
        ctx: &CancellationToken,
        src: &Object,
        dst_dir: &Object,
    ) -> DriverResult<Option<Object>>;

    async fn remove(&self, ctx: &CancellationToken, obj: &Object) -> DriverResult<()>;

    async fn copy(
        &self,
        ctx: &CancellationToken,
        src: &Object,
        dst_dir: &Object,
    ) -> DriverResult<Option<Object>>;

    async fn put(
        &self,
        ctx: &CancellationToken,
        dst_dir: &Object,
        stream: Box<dyn FileStreamer>,
        progress: UpdateProgress,
    ) -> DriverResult<Option<Object>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(DriverStatus::Work.to_string(), "work");
        assert_eq!(
            DriverStatus::NoWork("token expired".into()).to_string(),
            "nowork:token expired"
        );
    }

    #[test]
    fn capability_mask() {
        let caps = Capability::LIST | Capability::LINK;
        assert!(caps.contains(Capability::LIST));
        assert!(!caps.contains(Capability::GET));
    }
}
