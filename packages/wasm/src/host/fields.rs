//! Header-set brokering between host and guest
//!
//! Request headers are pushed as owned `fields` entries and lent to the
//! guest for the duration of a call; header sets returned by the guest are
//! popped with copy-out so the host takes ownership.

use wasmtime::component::{Resource, ResourceTable};
use wasmtime_wasi_http::types::{FieldMap, HostFields};

pub fn push_headers(
    table: &mut ResourceTable,
    fields: FieldMap,
) -> wasmtime::Result<Resource<HostFields>> {
    Ok(table.push(HostFields::Owned { fields })?)
}

/// Take ownership of a header set handed back by the guest.
pub fn pop_headers(
    table: &mut ResourceTable,
    handle: Resource<HostFields>,
) -> wasmtime::Result<FieldMap> {
    match table.delete(handle)? {
        HostFields::Owned { fields } => Ok(fields),
        HostFields::Ref { .. } => anyhow::bail!("fields handle is borrowed, not owned"),
    }
}

/// Best-effort removal of a header set the guest no longer needs.
pub fn drop_headers(table: &mut ResourceTable, handle: Resource<HostFields>) {
    let _ = table.delete(handle);
}
