//! Registration of the host API surface a driver plugin imports

use crate::abi::{AbiHashAlg, AbiHashInfo, AbiLogLevel, HOST_MODULE, TYPES_MODULE};
use crate::error::{WasmError, WasmResult};
use crate::host::{logging, StoreData};
use crate::stream::{ReadyPollable, SectionStream, TokenPollable, UploadStream};
use crate::upload::SectionMode;
use openlist_types::HashAlg;
use wasmtime::component::{Linker, Resource};
use wasmtime_wasi::p2::{subscribe, DynInputStream, DynPollable};

const BAD_DESCRIPTOR: &str = "UploadReadable: ErrorCodeBadDescriptor";

/// Register WASI, wasi-http and the `openlist:plugin-driver` host modules.
pub fn register_host_functions(linker: &mut Linker<StoreData>) -> WasmResult<()> {
    wasmtime_wasi::p2::add_to_linker_async(linker).map_err(|e| {
        WasmError::Initialization(format!("Failed to register WASI functions: {e}"))
    })?;
    wasmtime_wasi_http::add_only_http_to_linker_async(linker).map_err(|e| {
        WasmError::Initialization(format!("Failed to register WASI HTTP functions: {e}"))
    })?;
    register_host_module(linker)?;
    register_types_module(linker)?;
    Ok(())
}

fn register_host_module(linker: &mut Linker<StoreData>) -> WasmResult<()> {
    let mut host = linker.instance(HOST_MODULE).map_err(map_err)?;

    host.func_wrap(
        "log",
        |store: wasmtime::StoreContextMut<'_, StoreData>,
         (level, message): (AbiLogLevel, String)| {
            logging::guest_log(&store.data().host.plugin_id, level, &message);
            Ok(())
        },
    )
    .map_err(map_err)?;

    host.func_wrap(
        "load-config",
        |store: wasmtime::StoreContextMut<'_, StoreData>, (driver,): (u32,)| {
            let result = match store.data().host.drivers.get(driver) {
                Some(shared) => Ok(shared.additional.read().json.clone()),
                None => Err("driver handle is not registered, config loading too early".to_string()),
            };
            Ok((result,))
        },
    )
    .map_err(map_err)?;

    host.func_wrap_async(
        "save-config",
        |store: wasmtime::StoreContextMut<'_, StoreData>, (driver, config): (u32, Vec<u8>)| {
            Box::new(async move {
                let host = &store.data().host;
                let result = match host.drivers.get(driver) {
                    Some(shared) => {
                        shared.additional.write().json = config;
                        host.persist
                            .save_driver(&host.plugin_id, &shared)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    None => {
                        Err("driver handle is not registered, config saving too early".to_string())
                    }
                };
                Ok((result,))
            })
        },
    )
    .map_err(map_err)?;

    Ok(())
}

fn register_types_module(linker: &mut Linker<StoreData>) -> WasmResult<()> {
    let mut types = linker.instance(TYPES_MODULE).map_err(map_err)?;

    types
        .func_wrap(
            "[resource-drop]cancellable",
            |store: wasmtime::StoreContextMut<'_, StoreData>, (handle,): (u32,)| {
                store.data().host.contexts.remove(handle);
                Ok(())
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap(
            "[method]cancellable.subscribe",
            |mut store: wasmtime::StoreContextMut<'_, StoreData>, (handle,): (u32,)| {
                let token = store.data().host.contexts.get(handle);
                let table = &mut store.data_mut().resource_table;
                // Unknown handles get the ready sentinel so a late subscriber
                // never blocks forever.
                let pollable: Resource<DynPollable> = match token {
                    Some(token) => {
                        let res = table.push(TokenPollable::new(token))?;
                        subscribe(table, res)?
                    }
                    None => {
                        let res = table.push(ReadyPollable)?;
                        subscribe(table, res)?
                    }
                };
                Ok((pollable,))
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap(
            "[resource-drop]readable",
            |store: wasmtime::StoreContextMut<'_, StoreData>, (handle,): (u32,)| {
                store.data().host.uploads.remove(handle);
                Ok(())
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap(
            "[method]readable.streams",
            |mut store: wasmtime::StoreContextMut<'_, StoreData>, (handle,): (u32,)| {
                let result = match store.data().host.uploads.get(handle) {
                    None => Err(BAD_DESCRIPTOR.to_string()),
                    Some(upload) => match upload.begin_stream() {
                        Ok(()) => {
                            let stream: DynInputStream = Box::new(UploadStream::new(upload));
                            Ok(store.data_mut().resource_table.push(stream)?)
                        }
                        Err(e) => Err(e),
                    },
                };
                Ok((result,))
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap_async(
            "[method]readable.peek",
            |store: wasmtime::StoreContextMut<'_, StoreData>,
             (handle, offset, len): (u32, u64, u64)| {
                Box::new(section_stream(store, handle, SectionMode::Peek, offset, len))
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap_async(
            "[method]readable.range",
            |store: wasmtime::StoreContextMut<'_, StoreData>,
             (handle, offset, len): (u32, u64, u64)| {
                Box::new(section_stream(store, handle, SectionMode::Range, offset, len))
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap_async(
            "[method]readable.get-hasher",
            |store: wasmtime::StoreContextMut<'_, StoreData>,
             (handle, algs): (u32, Vec<AbiHashAlg>)| {
                Box::new(async move {
                    let result = match store.data().host.uploads.get(handle) {
                        None => Err(BAD_DESCRIPTOR.to_string()),
                        Some(upload) => {
                            let algs: Vec<HashAlg> =
                                algs.into_iter().map(HashAlg::from).collect();
                            upload.get_hasher(&algs).await.map(|digests| {
                                digests
                                    .into_iter()
                                    .map(|(alg, val)| AbiHashInfo {
                                        alg: alg.into(),
                                        val,
                                    })
                                    .collect::<Vec<_>>()
                            })
                        }
                    };
                    Ok((result,))
                })
            },
        )
        .map_err(map_err)?;

    types
        .func_wrap(
            "[method]readable.update-progress",
            |store: wasmtime::StoreContextMut<'_, StoreData>, (handle, progress): (u32, f64)| {
                if let Some(upload) = store.data().host.uploads.get(handle) {
                    upload.update_progress(progress);
                }
                Ok(())
            },
        )
        .map_err(map_err)?;

    Ok(())
}

async fn section_stream(
    mut store: wasmtime::StoreContextMut<'_, StoreData>,
    handle: u32,
    mode: SectionMode,
    offset: u64,
    len: u64,
) -> wasmtime::Result<(Result<Resource<DynInputStream>, String>,)> {
    let result = match store.data().host.uploads.get(handle) {
        None => Err(BAD_DESCRIPTOR.to_string()),
        Some(upload) => {
            let reserved = match mode {
                SectionMode::Peek => upload.begin_peek(offset, len).await,
                SectionMode::Range => upload.begin_range(offset, len).await,
            };
            match reserved {
                Ok(actual) => {
                    let stream: DynInputStream =
                        Box::new(SectionStream::new(upload, mode, offset, actual));
                    Ok(store.data_mut().resource_table.push(stream)?)
                }
                Err(e) => Err(e),
            }
        }
    };
    Ok((result,))
}

fn map_err(e: impl std::fmt::Display) -> WasmError {
    WasmError::Initialization(format!("Failed to register host function: {e}"))
}
