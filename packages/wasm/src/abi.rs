//! Guest ABI for the `openlist:plugin-driver` world
//!
//! Wire shapes exchanged with driver plugins, plus the conversions between
//! them and the host-side types. All handles are u32 with 0 reserved as the
//! "none" sentinel; timestamps are i64 nanoseconds since the epoch.

use chrono::DateTime;
use openlist_types::{
    Capability, DriverError, DriverProps, FieldKind, FormField, HashAlg, HashInfo, Object,
};
use wasmtime::component::{ComponentType, Lift, Lower, Resource};
use wasmtime_wasi::p2::DynOutputStream;
use wasmtime_wasi_http::types::HostFields;

/// Interface holding every guest export of a driver plugin.
pub const EXPORT_INTERFACE: &str = "openlist:plugin-driver/exports@0.1.0";
/// Host module with logging and config persistence.
pub const HOST_MODULE: &str = "openlist:plugin-driver/host@0.1.0";
/// Host module with the cancellable and readable resources.
pub const TYPES_MODULE: &str = "openlist:plugin-driver/types@0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ComponentType, Lift, Lower)]
#[component(enum)]
#[repr(u8)]
pub enum AbiLogLevel {
    #[component(name = "debug")]
    Debug,
    #[component(name = "info")]
    Info,
    #[component(name = "warn")]
    Warn,
    #[component(name = "error")]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ComponentType, Lift, Lower)]
#[component(enum)]
#[repr(u8)]
pub enum AbiHashAlg {
    #[component(name = "md5")]
    Md5,
    #[component(name = "sha1")]
    Sha1,
    #[component(name = "sha256")]
    Sha256,
    #[component(name = "gcid")]
    Gcid,
}

impl From<AbiHashAlg> for HashAlg {
    fn from(alg: AbiHashAlg) -> Self {
        match alg {
            AbiHashAlg::Md5 => HashAlg::Md5,
            AbiHashAlg::Sha1 => HashAlg::Sha1,
            AbiHashAlg::Sha256 => HashAlg::Sha256,
            AbiHashAlg::Gcid => HashAlg::Gcid,
        }
    }
}

impl From<HashAlg> for AbiHashAlg {
    fn from(alg: HashAlg) -> Self {
        match alg {
            HashAlg::Md5 => AbiHashAlg::Md5,
            HashAlg::Sha1 => AbiHashAlg::Sha1,
            HashAlg::Sha256 => AbiHashAlg::Sha256,
            HashAlg::Gcid => AbiHashAlg::Gcid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(record)]
pub struct AbiHashInfo {
    pub alg: AbiHashAlg,
    pub val: String,
}

pub fn hashes_to_abi(info: &HashInfo) -> Vec<AbiHashInfo> {
    info.iter()
        .map(|(alg, val)| AbiHashInfo {
            alg: alg.into(),
            val: val.to_string(),
        })
        .collect()
}

pub fn hashes_from_abi(hashes: &[AbiHashInfo]) -> HashInfo {
    let mut info = HashInfo::new();
    for h in hashes {
        info.set(h.alg.into(), h.val.clone());
    }
    info
}

#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(record)]
pub struct AbiObject {
    pub path: String,
    pub id: String,
    pub name: String,
    pub size: u64,
    #[component(name = "is-folder")]
    pub is_folder: bool,
    pub created: i64,
    pub modified: i64,
    pub thumbnail: Option<String>,
    pub hashes: Vec<AbiHashInfo>,
    pub extra: Vec<(String, String)>,
}

impl From<&Object> for AbiObject {
    fn from(obj: &Object) -> Self {
        AbiObject {
            path: obj.path.clone(),
            id: obj.id.clone(),
            name: obj.name.clone(),
            size: obj.size,
            is_folder: obj.is_folder,
            created: obj
                .create_time()
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or(0),
            modified: obj
                .modified
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or(0),
            thumbnail: obj.thumbnail.clone(),
            hashes: hashes_to_abi(&obj.hashes),
            extra: obj.extra.clone(),
        }
    }
}

impl From<AbiObject> for Object {
    fn from(obj: AbiObject) -> Self {
        Object {
            path: obj.path,
            id: obj.id,
            name: obj.name,
            size: obj.size,
            is_folder: obj.is_folder,
            created: (obj.created != 0).then(|| DateTime::from_timestamp_nanos(obj.created)),
            modified: (obj.modified != 0).then(|| DateTime::from_timestamp_nanos(obj.modified)),
            thumbnail: obj.thumbnail,
            hashes: hashes_from_abi(&obj.hashes),
            extra: obj.extra,
        }
    }
}

/// Operations a driver claims to implement.
wasmtime::component::flags! {
    AbiCapability {
        #[component(name = "get")]
        const GET;
        #[component(name = "list")]
        const LIST;
        #[component(name = "link")]
        const LINK;
        #[component(name = "mkdir")]
        const MKDIR;
        #[component(name = "rename")]
        const RENAME;
        #[component(name = "move")]
        const MOVE;
        #[component(name = "remove")]
        const REMOVE;
        #[component(name = "copy")]
        const COPY;
        #[component(name = "upload")]
        const UPLOAD;
    }
}

impl From<AbiCapability> for Capability {
    fn from(abi: AbiCapability) -> Self {
        let pairs = [
            (AbiCapability::GET, Capability::GET),
            (AbiCapability::LIST, Capability::LIST),
            (AbiCapability::LINK, Capability::LINK),
            (AbiCapability::MKDIR, Capability::MKDIR),
            (AbiCapability::RENAME, Capability::RENAME),
            (AbiCapability::MOVE, Capability::MOVE),
            (AbiCapability::REMOVE, Capability::REMOVE),
            (AbiCapability::COPY, Capability::COPY),
            (AbiCapability::UPLOAD, Capability::UPLOAD),
        ];
        let mut caps = Capability::empty();
        for (from, to) in pairs {
            if (abi & from) == from {
                caps |= to;
            }
        }
        caps
    }
}

#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(record)]
pub struct AbiDriverProps {
    pub name: String,
    #[component(name = "only-proxy")]
    pub only_proxy: bool,
    #[component(name = "no-cache")]
    pub no_cache: bool,
    pub alert: String,
    #[component(name = "no-overwrite-upload")]
    pub no_overwrite_upload: bool,
    #[component(name = "proxy-range")]
    pub proxy_range: bool,
    pub capabilities: AbiCapability,
}

impl From<AbiDriverProps> for DriverProps {
    fn from(props: AbiDriverProps) -> Self {
        DriverProps {
            name: props.name,
            only_proxy: props.only_proxy,
            no_cache: props.no_cache,
            alert: props.alert,
            no_overwrite_upload: props.no_overwrite_upload,
            proxy_range: props.proxy_range,
            capabilities: props.capabilities.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(variant)]
pub enum AbiFieldKind {
    #[component(name = "string")]
    String(String),
    #[component(name = "password")]
    Password(String),
    #[component(name = "number")]
    Number(f64),
    #[component(name = "boolean")]
    Boolean(bool),
    #[component(name = "text")]
    Text(String),
    #[component(name = "select")]
    Select(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(record)]
pub struct AbiFormField {
    pub name: String,
    pub label: String,
    pub kind: AbiFieldKind,
    pub required: bool,
    pub help: String,
}

impl From<AbiFormField> for FormField {
    fn from(field: AbiFormField) -> Self {
        FormField {
            name: field.name,
            label: field.label,
            kind: match field.kind {
                AbiFieldKind::String(d) => FieldKind::String(d),
                AbiFieldKind::Password(d) => FieldKind::Password(d),
                AbiFieldKind::Number(d) => FieldKind::Number(d),
                AbiFieldKind::Boolean(d) => FieldKind::Boolean(d),
                AbiFieldKind::Text(d) => FieldKind::Text(d),
                AbiFieldKind::Select(options) => FieldKind::Select(options),
            },
            required: field.required,
            help: field.help,
        }
    }
}

/// Guest-to-host error codes; exactly one case per error.
#[derive(Debug, Clone, PartialEq, ComponentType, Lift, Lower)]
#[component(variant)]
pub enum AbiErrCode {
    #[component(name = "invalid-handle")]
    InvalidHandle,
    #[component(name = "not-implemented")]
    NotImplemented,
    #[component(name = "not-supported")]
    NotSupported,
    #[component(name = "not-found")]
    NotFound,
    #[component(name = "not-folder")]
    NotFolder,
    #[component(name = "not-file")]
    NotFile,
    #[component(name = "generic")]
    Generic(String),
    #[component(name = "unauthorized")]
    Unauthorized(String),
}

impl From<AbiErrCode> for DriverError {
    fn from(code: AbiErrCode) -> Self {
        match code {
            AbiErrCode::InvalidHandle => DriverError::StorageNotFound,
            AbiErrCode::NotImplemented => DriverError::NotImplemented,
            AbiErrCode::NotSupported => DriverError::NotSupported,
            AbiErrCode::NotFound => DriverError::ObjectNotFound,
            AbiErrCode::NotFolder => DriverError::NotFolder,
            AbiErrCode::NotFile => DriverError::NotFile,
            AbiErrCode::Generic(msg) => DriverError::Other(msg),
            AbiErrCode::Unauthorized(msg) => DriverError::Unauthorized(msg),
        }
    }
}

#[derive(ComponentType, Lower)]
#[component(record)]
pub struct AbiLinkArgs {
    pub ip: String,
    pub headers: Resource<HostFields>,
}

#[derive(ComponentType, Lift)]
#[component(record)]
pub struct AbiDirectLink {
    pub url: String,
    pub headers: Resource<HostFields>,
    pub expiration: Option<u64>,
}

#[derive(ComponentType, Lift)]
#[component(variant)]
pub enum AbiLinkResource {
    #[component(name = "direct")]
    Direct(AbiDirectLink),
    #[component(name = "range-stream")]
    RangeStream,
}

#[derive(ComponentType, Lift)]
#[component(record)]
pub struct AbiLinkResult {
    pub file: Option<AbiObject>,
    pub resource: AbiLinkResource,
}

#[derive(ComponentType, Lower)]
#[component(record)]
pub struct AbiRangeSpec {
    pub offset: u64,
    pub size: u64,
    pub stream: Resource<DynOutputStream>,
}

#[derive(ComponentType, Lower)]
#[component(record)]
pub struct AbiUploadRequest {
    pub target: AbiObject,
    /// Handle into the host upload table; released by the host.
    pub content: u32,
    pub exist: Option<AbiObject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_code_mapping_is_deterministic() {
        let cases = [
            (AbiErrCode::InvalidHandle, "storage not found"),
            (AbiErrCode::NotImplemented, "not implemented"),
            (AbiErrCode::NotSupported, "not supported"),
            (AbiErrCode::NotFound, "object not found"),
            (AbiErrCode::NotFolder, "not a folder"),
            (AbiErrCode::NotFile, "not a file"),
            (AbiErrCode::Generic("boom".into()), "boom"),
            (AbiErrCode::Unauthorized("token expired".into()), "token expired"),
        ];
        for (code, message) in cases {
            assert_eq!(DriverError::from(code).to_string(), message);
        }
    }

    #[test]
    fn object_round_trip() {
        let mut hashes = HashInfo::new();
        hashes.set(HashAlg::Md5, "0".repeat(32));
        let obj = Object {
            path: "/a/b".into(),
            id: "id1".into(),
            name: "b".into(),
            size: 42,
            is_folder: false,
            created: Some(DateTime::from_timestamp_nanos(1_000_000_000)),
            modified: Some(DateTime::from_timestamp_nanos(2_000_000_000)),
            thumbnail: Some("https://example.com/t.png".into()),
            hashes,
            extra: vec![("k".into(), "v".into())],
        };
        let back: Object = AbiObject::from(&obj).into();
        assert_eq!(back, obj);
    }

    #[test]
    fn missing_timestamps_stay_missing() {
        let wire = AbiObject::from(&Object::root());
        assert_eq!(wire.created, 0);
        let back: Object = wire.into();
        assert_eq!(back.created, None);
        assert_eq!(back.modified, None);
    }

    #[test]
    fn capability_conversion() {
        let abi = AbiCapability::LIST | AbiCapability::UPLOAD;
        let caps: Capability = abi.into();
        assert!(caps.contains(Capability::LIST));
        assert!(caps.contains(Capability::UPLOAD));
        assert!(!caps.contains(Capability::GET));
    }
}
