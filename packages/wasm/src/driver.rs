//! Host-side proxy implementing [`Driver`] over a plugin's guest exports
//!
//! Every operation follows the same template: check the capability bit,
//! register the caller's cancellation token (and any other per-call
//! resources) in the host tables, marshal arguments into ABI records, invoke
//! the guest export, and translate the outcome. Transport failures are
//! logged and surfaced as a constant message; guest error codes map onto
//! [`DriverError`] deterministically.

use crate::abi::{
    AbiDriverProps, AbiErrCode, AbiFormField, AbiLinkArgs, AbiLinkResource, AbiLinkResult,
    AbiObject, AbiRangeSpec, AbiUploadRequest,
};
use crate::error::INTERNAL_PLUGIN_ERROR;
use crate::host::{fields, DriverPersist, DriverShared};
use crate::plugin::{CallError, DriverPlugin};
use crate::resource::ScopedHandle;
use crate::stream::capped_pipe;
use crate::upload::UploadReadable;
use async_trait::async_trait;
use openlist_types::{
    Additional, Capability, Driver, DriverError, DriverProps, DriverResult, DriverStatus,
    FileStreamer, FormField, Link, LinkArgs, Object, RangeReader, UpdateProgress,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use wasmtime::component::Resource;
use wasmtime_wasi::p2::DynOutputStream;

/// Buffered bytes per in-flight link-range pipe.
const RANGE_PIPE_CAPACITY: usize = 256 * 1024;

/// A uniquely-owned driver instance inside a plugin. Dropping it schedules
/// the guest-side destructor and removes the instance from the host table.
pub struct WasmDriver {
    plugin: Arc<DriverPlugin>,
    handle: u32,
    shared: Arc<DriverShared>,
}

impl WasmDriver {
    pub(crate) fn new(plugin: Arc<DriverPlugin>, handle: u32, shared: Arc<DriverShared>) -> Self {
        Self {
            plugin,
            handle,
            shared,
        }
    }

    pub fn plugin_id(&self) -> &str {
        self.plugin.id()
    }

    pub fn status(&self) -> DriverStatus {
        self.shared.status.read().clone()
    }

    /// Cached properties from construction time; [`Driver::config`] refreshes
    /// them from the guest.
    pub fn props(&self) -> DriverProps {
        self.shared.props.read().clone()
    }

    fn gate(&self, cap: Capability) -> DriverResult<()> {
        if !self.shared.props.read().capabilities.contains(cap) {
            return Err(DriverError::NotImplemented);
        }
        if let DriverStatus::NoWork(msg) = &*self.shared.status.read() {
            return Err(DriverError::Unauthorized(msg.clone()));
        }
        Ok(())
    }

    fn scoped_ctx(&self, ctx: &CancellationToken) -> ScopedHandle<CancellationToken> {
        ScopedHandle::add(self.plugin.contexts(), ctx.clone())
    }

    async fn guest_result<R>(
        &self,
        op: &str,
        result: Result<(Result<R, AbiErrCode>,), CallError>,
    ) -> DriverResult<R> {
        match result {
            Err(CallError::MissingExport(_)) => Err(DriverError::NotImplemented),
            Err(CallError::Transport(e)) => {
                tracing::error!(plugin = self.plugin.id(), op, "plugin call failed: {e:#}");
                Err(DriverError::other(INTERNAL_PLUGIN_ERROR))
            }
            Ok((Ok(value),)) => Ok(value),
            Ok((Err(code),)) => {
                let persist = self.plugin.persist();
                Err(map_guest_err(&persist, self.plugin.id(), &self.shared, code).await)
            }
        }
    }
}

/// Translate a guest error code, flipping the driver to `nowork` exactly
/// once on an authorization failure.
async fn map_guest_err(
    persist: &Arc<dyn DriverPersist>,
    plugin_id: &str,
    shared: &Arc<DriverShared>,
    code: AbiErrCode,
) -> DriverError {
    if let AbiErrCode::Unauthorized(msg) = &code {
        if shared.status.read().is_work()
            && shared
                .nowork_flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            *shared.status.write() = DriverStatus::NoWork(msg.clone());
            if let Err(e) = persist.save_driver(plugin_id, shared).await {
                tracing::error!(plugin = plugin_id, "failed to persist driver status: {e:#}");
            }
            shared.nowork_flag.store(false, Ordering::SeqCst);
        }
    }
    code.into()
}

#[async_trait]
impl Driver for WasmDriver {
    async fn config(&self) -> DriverProps {
        match self
            .plugin
            .call::<(u32,), (AbiDriverProps,)>("[method]driver.get-properties", (self.handle,))
            .await
        {
            Ok((props,)) => {
                let props: DriverProps = props.into();
                *self.shared.props.write() = props.clone();
                props
            }
            Err(e) => {
                tracing::error!(
                    plugin = self.plugin.id(),
                    "get-properties failed, using cached value: {}",
                    e.into_wasm()
                );
                self.shared.props.read().clone()
            }
        }
    }

    async fn addition(&self) -> Additional {
        match self
            .plugin
            .call::<(u32,), (Vec<AbiFormField>,)>("[method]driver.get-form-meta", (self.handle,))
            .await
        {
            Ok((forms,)) => {
                let forms: Vec<FormField> = forms.into_iter().map(FormField::from).collect();
                *self.shared.forms.write() = forms.clone();
                let mut additional = self.shared.additional.write();
                additional.forms = forms;
                additional.clone()
            }
            Err(e) => {
                tracing::error!(
                    plugin = self.plugin.id(),
                    "get-form-meta failed, using cached value: {}",
                    e.into_wasm()
                );
                self.shared.additional.read().clone()
            }
        }
    }

    async fn init(&self, ctx: &CancellationToken) -> DriverResult<()> {
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32), (Result<(), AbiErrCode>,)>(
                "[method]driver.init",
                (self.handle, ctx_guard.handle()),
            )
            .await;
        self.guest_result("init", result).await
    }

    async fn drop(&self, ctx: &CancellationToken) -> DriverResult<()> {
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32), (Result<(), AbiErrCode>,)>(
                "[method]driver.drop",
                (self.handle, ctx_guard.handle()),
            )
            .await;
        self.guest_result("drop", result).await
    }

    async fn get_root(&self, ctx: &CancellationToken) -> DriverResult<Object> {
        self.gate(Capability::LIST)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32), (Result<AbiObject, AbiErrCode>,)>(
                "[method]driver.get-root",
                (self.handle, ctx_guard.handle()),
            )
            .await;
        self.guest_result("get-root", result).await.map(Object::from)
    }

    async fn get(&self, ctx: &CancellationToken, path: &str) -> DriverResult<Object> {
        self.gate(Capability::GET)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, String), (Result<AbiObject, AbiErrCode>,)>(
                "[method]driver.get-file",
                (self.handle, ctx_guard.handle(), path.to_string()),
            )
            .await;
        self.guest_result("get-file", result).await.map(Object::from)
    }

    async fn list(&self, ctx: &CancellationToken, dir: &Object) -> DriverResult<Vec<Object>> {
        self.gate(Capability::LIST)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject), (Result<Vec<AbiObject>, AbiErrCode>,)>(
                "[method]driver.list-files",
                (self.handle, ctx_guard.handle(), AbiObject::from(dir)),
            )
            .await;
        self.guest_result("list-files", result)
            .await
            .map(|objs| objs.into_iter().map(Object::from).collect())
    }

    async fn link(
        &self,
        ctx: &CancellationToken,
        file: &mut Object,
        args: LinkArgs,
    ) -> DriverResult<Link> {
        self.gate(Capability::LINK)?;
        let ctx_guard = self.scoped_ctx(ctx);

        let mut store = self.plugin.lock_store().await;
        let headers_rep = fields::push_headers(
            &mut store.data_mut().resource_table,
            args.headers.clone(),
        )
        .map_err(|e| {
            tracing::error!(plugin = self.plugin.id(), "failed to register headers: {e:#}");
            DriverError::other(INTERNAL_PLUGIN_ERROR)
        })?
        .rep();

        let abi_args = AbiLinkArgs {
            ip: args.ip.clone(),
            headers: Resource::new_borrow(headers_rep),
        };
        let result = self
            .plugin
            .call_in::<(u32, u32, AbiObject, AbiLinkArgs), (Result<AbiLinkResult, AbiErrCode>,)>(
                &mut store,
                "[method]driver.link-file",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(&*file),
                    abi_args,
                ),
            )
            .await;
        fields::drop_headers(
            &mut store.data_mut().resource_table,
            Resource::new_own(headers_rep),
        );

        let link: AbiLinkResult = match result {
            Err(CallError::MissingExport(_)) => return Err(DriverError::NotImplemented),
            Err(CallError::Transport(e)) => {
                tracing::error!(plugin = self.plugin.id(), "link-file failed: {e:#}");
                return Err(DriverError::other(INTERNAL_PLUGIN_ERROR));
            }
            Ok((Err(code),)) => {
                drop(store);
                let persist = self.plugin.persist();
                return Err(map_guest_err(&persist, self.plugin.id(), &self.shared, code).await);
            }
            Ok((Ok(link),)) => link,
        };

        // The backend may only now know the object's real id/size/hashes.
        if let Some(updated) = link.file {
            *file = updated.into();
        }

        match link.resource {
            AbiLinkResource::Direct(direct) => {
                let headers =
                    match fields::pop_headers(&mut store.data_mut().resource_table, direct.headers)
                    {
                        Ok(map) => map,
                        Err(e) => {
                            tracing::warn!(
                                plugin = self.plugin.id(),
                                "dropping unusable link headers: {e:#}"
                            );
                            Default::default()
                        }
                    };
                Ok(Link::Direct {
                    url: direct.url,
                    headers,
                    expiration: direct.expiration.map(Duration::from_nanos),
                })
            }
            AbiLinkResource::RangeStream => {
                drop(store);
                Ok(Link::Range(Arc::new(WasmRangeReader {
                    plugin: self.plugin.clone(),
                    shared: self.shared.clone(),
                    driver_handle: self.handle,
                    obj: AbiObject::from(&*file),
                    ip: args.ip,
                    headers: args.headers,
                    size: file.size,
                })))
            }
        }
    }

    async fn make_dir(
        &self,
        ctx: &CancellationToken,
        parent: &Object,
        name: &str,
    ) -> DriverResult<Option<Object>> {
        self.gate(Capability::MKDIR)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject, String), (Result<Option<AbiObject>, AbiErrCode>,)>(
                "[method]driver.make-dir",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(parent),
                    name.to_string(),
                ),
            )
            .await;
        self.guest_result("make-dir", result)
            .await
            .map(|obj| obj.map(Object::from))
    }

    async fn rename(
        &self,
        ctx: &CancellationToken,
        obj: &Object,
        new_name: &str,
    ) -> DriverResult<Option<Object>> {
        self.gate(Capability::RENAME)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject, String), (Result<Option<AbiObject>, AbiErrCode>,)>(
                "[method]driver.rename-file",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(obj),
                    new_name.to_string(),
                ),
            )
            .await;
        self.guest_result("rename-file", result)
            .await
            .map(|obj| obj.map(Object::from))
    }

    async fn move_to(
        &self,
        ctx: &CancellationToken,
        src: &Object,
        dst_dir: &Object,
    ) -> DriverResult<Option<Object>> {
        self.gate(Capability::MOVE)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject, AbiObject), (Result<Option<AbiObject>, AbiErrCode>,)>(
                "[method]driver.move-file",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(src),
                    AbiObject::from(dst_dir),
                ),
            )
            .await;
        self.guest_result("move-file", result)
            .await
            .map(|obj| obj.map(Object::from))
    }

    async fn remove(&self, ctx: &CancellationToken, obj: &Object) -> DriverResult<()> {
        self.gate(Capability::REMOVE)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject), (Result<(), AbiErrCode>,)>(
                "[method]driver.remove-file",
                (self.handle, ctx_guard.handle(), AbiObject::from(obj)),
            )
            .await;
        self.guest_result("remove-file", result).await
    }

    async fn copy(
        &self,
        ctx: &CancellationToken,
        src: &Object,
        dst_dir: &Object,
    ) -> DriverResult<Option<Object>> {
        self.gate(Capability::COPY)?;
        let ctx_guard = self.scoped_ctx(ctx);
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject, AbiObject), (Result<Option<AbiObject>, AbiErrCode>,)>(
                "[method]driver.copy-file",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(src),
                    AbiObject::from(dst_dir),
                ),
            )
            .await;
        self.guest_result("copy-file", result)
            .await
            .map(|obj| obj.map(Object::from))
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        dst_dir: &Object,
        stream: Box<dyn FileStreamer>,
        progress: UpdateProgress,
    ) -> DriverResult<Option<Object>> {
        self.gate(Capability::UPLOAD)?;
        let upload = UploadReadable::new(stream, progress);
        let ctx_guard = self.scoped_ctx(ctx);
        let upload_guard = ScopedHandle::add(self.plugin.uploads(), upload.clone());

        let request = AbiUploadRequest {
            target: AbiObject::from(upload.obj()),
            content: upload_guard.handle(),
            exist: upload.exist().map(AbiObject::from),
        };
        let result = self
            .plugin
            .call::<(u32, u32, AbiObject, AbiUploadRequest), (Result<Option<AbiObject>, AbiErrCode>,)>(
                "[method]driver.upload-file",
                (
                    self.handle,
                    ctx_guard.handle(),
                    AbiObject::from(dst_dir),
                    request,
                ),
            )
            .await;
        self.guest_result("upload-file", result)
            .await
            .map(|obj| obj.map(Object::from))
    }
}

impl Drop for WasmDriver {
    fn drop(&mut self) {
        self.plugin.drivers().remove(self.handle);
        let plugin = self.plugin.clone();
        let handle = self.handle;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = plugin.call::<(u32,), ()>("[dtor]driver", (handle,)).await {
                    tracing::debug!(
                        plugin = plugin.id(),
                        "driver destructor failed: {}",
                        e.into_wasm()
                    );
                }
            });
        }
    }
}

/// Serves sub-ranges by driving `driver.link-range` through a capped pipe.
struct WasmRangeReader {
    plugin: Arc<DriverPlugin>,
    shared: Arc<DriverShared>,
    driver_handle: u32,
    obj: AbiObject,
    ip: String,
    headers: http::HeaderMap,
    size: u64,
}

#[async_trait]
impl RangeReader for WasmRangeReader {
    async fn range_read(
        &self,
        ctx: &CancellationToken,
        offset: u64,
        len: u64,
    ) -> DriverResult<Box<dyn AsyncRead + Send + Unpin>> {
        let size = if offset >= self.size {
            0
        } else {
            len.min(self.size - offset)
        };
        let (writer, reader, control) = capped_pipe(size, RANGE_PIPE_CAPACITY);

        let plugin = self.plugin.clone();
        let shared = self.shared.clone();
        let driver_handle = self.driver_handle;
        let obj = self.obj.clone();
        let ip = self.ip.clone();
        let headers = self.headers.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let ctx_guard = ScopedHandle::add(plugin.contexts(), ctx);
            let mut store = plugin.lock_store().await;

            let headers_rep =
                match fields::push_headers(&mut store.data_mut().resource_table, headers) {
                    Ok(res) => res.rep(),
                    Err(e) => {
                        tracing::error!(plugin = plugin.id(), "failed to register headers: {e:#}");
                        control.fail(INTERNAL_PLUGIN_ERROR);
                        return;
                    }
                };
            let stream: DynOutputStream = Box::new(writer);
            let stream = match store.data_mut().resource_table.push(stream) {
                Ok(res) => res,
                Err(e) => {
                    fields::drop_headers(
                        &mut store.data_mut().resource_table,
                        Resource::new_own(headers_rep),
                    );
                    tracing::error!(plugin = plugin.id(), "failed to register stream: {e:#}");
                    control.fail(INTERNAL_PLUGIN_ERROR);
                    return;
                }
            };

            let params = (
                driver_handle,
                ctx_guard.handle(),
                obj,
                AbiLinkArgs {
                    ip,
                    headers: Resource::new_borrow(headers_rep),
                },
                AbiRangeSpec {
                    offset,
                    size,
                    stream,
                },
            );
            let result = plugin
                .call_in::<(u32, u32, AbiObject, AbiLinkArgs, AbiRangeSpec), (Result<(), AbiErrCode>,)>(
                    &mut store,
                    "[method]driver.link-range",
                    params,
                )
                .await;
            fields::drop_headers(
                &mut store.data_mut().resource_table,
                Resource::new_own(headers_rep),
            );
            drop(store);

            match result {
                Err(CallError::MissingExport(_)) => {
                    control.fail(DriverError::NotImplemented.to_string());
                }
                Err(CallError::Transport(e)) => {
                    tracing::error!(plugin = plugin.id(), "link-range failed: {e:#}");
                    control.fail(INTERNAL_PLUGIN_ERROR);
                }
                Ok((Err(code),)) => {
                    let persist = plugin.persist();
                    control.fail(
                        map_guest_err(&persist, plugin.id(), &shared, code)
                            .await
                            .to_string(),
                    );
                }
                Ok((Ok(()),)) => control.finish(),
            }
        });

        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingPersist {
        saves: AtomicUsize,
    }

    #[async_trait]
    impl DriverPersist for CountingPersist {
        async fn save_driver(
            &self,
            _plugin_id: &str,
            _driver: &DriverShared,
        ) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn shared() -> Arc<DriverShared> {
        Arc::new(DriverShared::new(
            DriverProps {
                name: "demo".into(),
                only_proxy: false,
                no_cache: false,
                alert: String::new(),
                no_overwrite_upload: false,
                proxy_range: false,
                capabilities: Capability::LIST,
            },
            Vec::new(),
        ))
    }

    #[tokio::test]
    async fn unauthorized_transitions_status_once() {
        let counting = Arc::new(CountingPersist {
            saves: AtomicUsize::new(0),
        });
        let persist: Arc<dyn DriverPersist> = counting.clone();
        let shared = shared();
        let code = AbiErrCode::Unauthorized("token expired".to_string());

        let (a, b) = tokio::join!(
            map_guest_err(&persist, "openlist.driver.demo", &shared, code.clone()),
            map_guest_err(&persist, "openlist.driver.demo", &shared, code.clone()),
        );
        assert_eq!(a.to_string(), "token expired");
        assert_eq!(b.to_string(), "token expired");
        assert_eq!(
            *shared.status.read(),
            DriverStatus::NoWork("token expired".into())
        );

        // Only the transition wrote; a later call changes nothing.
        map_guest_err(&persist, "openlist.driver.demo", &shared, code).await;
        assert_eq!(counting.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_authorization_errors_leave_status_alone() {
        let persist: Arc<dyn DriverPersist> = Arc::new(CountingPersist {
            saves: AtomicUsize::new(0),
        });
        let shared = shared();
        let err = map_guest_err(
            &persist,
            "openlist.driver.demo",
            &shared,
            AbiErrCode::NotFound,
        )
        .await;
        assert!(matches!(err, DriverError::ObjectNotFound));
        assert!(shared.status.read().is_work());
    }
}
