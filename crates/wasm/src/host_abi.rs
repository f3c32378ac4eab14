//! The custom `env` host module installed alongside WASI P1: the
//! linear-memory `(ptr, size)` ABI table from the module contract,
//! the URL allow-list, and the per-instance bookkeeping it reads back
//! through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;
use wasmtime::{Caller, Extern, Linker, Memory};

use crate::error::{
    WasmError, WasmResult, ERR_CAPABILITY_DENIED, ERR_GENERIC, ERR_INVALID_ARG, ERR_MEMORY_ACCESS,
    ERR_NOT_FOUND, ERR_UPSTREAM,
};
use crate::{ExecutionHost, TargetKind};

/// Last HTTP response captured for this instance, read back through
/// `get_last_response_status`/`get_last_response_body`/`get_last_response_header`.
#[derive(Debug, Clone, Default)]
pub struct LastResponse {
    pub status: u32,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Store data for one module invocation. Bookkeeping is keyed by this
/// struct's lifetime (one per call), not by the module-instance pointer
/// — re-running the same module twice never sees stale state.
pub struct HostState {
    pub wasi: wasmtime_wasi::p1::WasiP1Ctx,
    pub limits: wasmtime::StoreLimits,
    pub instance_id: u64,
    pub allowed_url_prefixes: Vec<String>,
    pub working_dir: Option<String>,
    pub new_working_directory: Option<String>,
    pub last_response: Option<LastResponse>,
    pub last_operation_result: Option<Vec<u8>>,
    pub last_operation_status: u32,
    pub deadline: Instant,
    pub execution_host: Arc<dyn ExecutionHost>,
    pub runtime_handle: tokio::runtime::Handle,
    pub http_client: reqwest::Client,
}

fn get_memory(caller: &mut Caller<'_, HostState>) -> WasmResult<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(mem)) => Ok(mem),
        _ => Err(WasmError::Instantiation(
            "module does not export a `memory`".to_string(),
        )),
    }
}

fn read_mem_bytes(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> WasmResult<Vec<u8>> {
    let memory = get_memory(caller)?;
    let data = memory.data(caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| WasmError::Capability {
            reason: "pointer arithmetic overflow".to_string(),
            code: ERR_MEMORY_ACCESS,
        })?;
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| WasmError::Capability {
            reason: "out-of-bounds memory access".to_string(),
            code: ERR_MEMORY_ACCESS,
        })
}

fn read_mem_string(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> WasmResult<String> {
    let bytes = read_mem_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).map_err(|e| WasmError::Capability {
        reason: format!("invalid UTF-8: {e}"),
        code: ERR_INVALID_ARG,
    })
}

/// Implements the size-probe buffer convention: `buf_size == 0` returns
/// the required length, a too-small buffer returns `ERR_INVALID_ARG`,
/// otherwise the data is copied and its length returned.
fn write_buf(
    caller: &mut Caller<'_, HostState>,
    buf_ptr: u32,
    buf_size: u32,
    data: &[u8],
) -> u32 {
    if buf_size == 0 {
        return u32::try_from(data.len()).unwrap_or(u32::MAX);
    }
    if (buf_size as usize) < data.len() {
        return ERR_INVALID_ARG;
    }
    let memory = match get_memory(caller) {
        Ok(m) => m,
        Err(_) => return ERR_MEMORY_ACCESS,
    };
    if memory
        .write(&mut *caller, buf_ptr as usize, data)
        .is_err()
    {
        return ERR_MEMORY_ACCESS;
    }
    u32::try_from(data.len()).unwrap_or(u32::MAX)
}

fn is_url_allowed(url: &str, allowed_prefixes: &[String]) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    allowed_prefixes.iter().any(|prefix| url.starts_with(prefix))
}

fn remaining_budget(state: &HostState) -> Duration {
    state
        .deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
}

/// Register every host function in the module contract's `env` import
/// module onto `linker`.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "http_request",
        |mut caller: Caller<'_, HostState>,
         method_ptr: u32,
         method_len: u32,
         url_ptr: u32,
         url_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> u32 {
            do_http_request(
                &mut caller, method_ptr, method_len, url_ptr, url_len, body_ptr, body_len, 0, 0,
            )
        },
    )?;

    linker.func_wrap(
        "env",
        "http_request_with_headers",
        |mut caller: Caller<'_, HostState>,
         method_ptr: u32,
         method_len: u32,
         url_ptr: u32,
         url_len: u32,
         body_ptr: u32,
         body_len: u32,
         headers_ptr: u32,
         headers_len: u32|
         -> u32 {
            do_http_request(
                &mut caller,
                method_ptr,
                method_len,
                url_ptr,
                url_len,
                body_ptr,
                body_len,
                headers_ptr,
                headers_len,
            )
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_status",
        |caller: Caller<'_, HostState>| -> u32 {
            caller
                .data()
                .last_response
                .as_ref()
                .map_or(0, |r| r.status)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_body",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_size: u32| -> u32 {
            let body = caller
                .data()
                .last_response
                .as_ref()
                .map(|r| r.body.clone())
                .unwrap_or_default();
            write_buf(&mut caller, buf_ptr, buf_size, &body)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_header",
        |mut caller: Caller<'_, HostState>,
         name_ptr: u32,
         name_len: u32,
         buf_ptr: u32,
         buf_size: u32|
         -> u32 {
            let name = match read_mem_string(&mut caller, name_ptr, name_len) {
                Ok(n) => n,
                Err(_) => return ERR_MEMORY_ACCESS,
            };
            let value = caller
                .data()
                .last_response
                .as_ref()
                .and_then(|r| r.headers.get(&name.to_lowercase()).cloned());
            match value {
                Some(v) => write_buf(&mut caller, buf_ptr, buf_size, v.as_bytes()),
                None => 0,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "execute_target",
        |mut caller: Caller<'_, HostState>,
         kind_ptr: u32,
         kind_len: u32,
         id_ptr: u32,
         id_len: u32,
         params_ptr: u32,
         params_len: u32|
         -> u32 {
            do_execute_target(
                &mut caller, kind_ptr, kind_len, id_ptr, id_len, params_ptr, params_len,
            )
        },
    )?;

    linker.func_wrap(
        "env",
        "trigger_workflow_or_agent",
        |mut caller: Caller<'_, HostState>,
         kind_ptr: u32,
         kind_len: u32,
         id_ptr: u32,
         id_len: u32,
         params_ptr: u32,
         params_len: u32|
         -> u32 {
            do_execute_target(
                &mut caller, kind_ptr, kind_len, id_ptr, id_len, params_ptr, params_len,
            )
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_operation_result",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_size: u32| -> u32 {
            let result = caller.data().last_operation_result.clone().unwrap_or_default();
            write_buf(&mut caller, buf_ptr, buf_size, &result)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_operation_status",
        |caller: Caller<'_, HostState>| -> u32 { caller.data().last_operation_status },
    )?;

    linker.func_wrap(
        "env",
        "get_job_output",
        |mut caller: Caller<'_, HostState>,
         job_id_ptr: u32,
         job_id_len: u32,
         buf_ptr: u32,
         buf_size: u32|
         -> u32 {
            let job_id = match read_mem_string(&mut caller, job_id_ptr, job_id_len)
                .ok()
                .and_then(|s| Uuid::parse_str(&s).ok())
            {
                Some(id) => id,
                None => return ERR_INVALID_ARG,
            };
            let host = Arc::clone(&caller.data().execution_host);
            let handle = caller.data().runtime_handle.clone();
            let result = handle.block_on(host.get_job_output(job_id));
            match result {
                Ok(Some(value)) => {
                    let bytes = serde_json::to_vec(&value).unwrap_or_default();
                    write_buf(&mut caller, buf_ptr, buf_size, &bytes)
                }
                Ok(None) => ERR_NOT_FOUND,
                Err(_) => ERR_UPSTREAM,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "wait_for_job_and_get_output",
        |mut caller: Caller<'_, HostState>,
         job_id_ptr: u32,
         job_id_len: u32,
         buf_ptr: u32,
         buf_size: u32|
         -> u32 {
            let job_id = match read_mem_string(&mut caller, job_id_ptr, job_id_len)
                .ok()
                .and_then(|s| Uuid::parse_str(&s).ok())
            {
                Some(id) => id,
                None => return ERR_INVALID_ARG,
            };
            let deadline = caller.data().deadline;
            let host = Arc::clone(&caller.data().execution_host);
            let handle = caller.data().runtime_handle.clone();
            let result = handle.block_on(host.wait_for_job_output(job_id, deadline));
            match result {
                Ok(value) => {
                    let bytes = serde_json::to_vec(&value).unwrap_or_default();
                    write_buf(&mut caller, buf_ptr, buf_size, &bytes)
                }
                Err(WasmError::Deadline) => ERR_GENERIC,
                Err(_) => ERR_UPSTREAM,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_working_directory",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_size: u32| -> u32 {
            let dir = caller.data().working_dir.clone().unwrap_or_default();
            write_buf(&mut caller, buf_ptr, buf_size, dir.as_bytes())
        },
    )?;

    linker.func_wrap(
        "env",
        "set_working_directory",
        |mut caller: Caller<'_, HostState>, path_ptr: u32, path_len: u32| -> u32 {
            let path = match read_mem_string(&mut caller, path_ptr, path_len) {
                Ok(p) => p,
                Err(_) => return ERR_MEMORY_ACCESS,
            };
            let resolved = resolve_against(caller.data().working_dir.as_deref(), &path);
            if std::fs::create_dir_all(&resolved).is_err() {
                return ERR_GENERIC;
            }
            caller.data_mut().working_dir = Some(resolved.clone());
            caller.data_mut().new_working_directory = Some(resolved);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "create_git_worktree",
        |mut caller: Caller<'_, HostState>,
         name_ptr: u32,
         name_len: u32,
         base_path_ptr: u32,
         base_path_len: u32|
         -> u32 {
            let Some(working_dir) = caller.data().working_dir.clone() else {
                return ERR_CAPABILITY_DENIED;
            };
            let name = match read_mem_string(&mut caller, name_ptr, name_len) {
                Ok(n) => n,
                Err(_) => return ERR_MEMORY_ACCESS,
            };
            let base_path = if base_path_len == 0 {
                working_dir.clone()
            } else {
                match read_mem_string(&mut caller, base_path_ptr, base_path_len) {
                    Ok(p) => p,
                    Err(_) => return ERR_MEMORY_ACCESS,
                }
            };
            if !std::path::Path::new(&base_path).join(".git").exists() {
                return ERR_CAPABILITY_DENIED;
            }
            let worktree_path = std::path::Path::new(&base_path)
                .parent()
                .unwrap_or_else(|| std::path::Path::new(&base_path))
                .join(&name);
            let output = std::process::Command::new("git")
                .arg("-C")
                .arg(&base_path)
                .arg("worktree")
                .arg("add")
                .arg(&worktree_path)
                .output();
            match output {
                Ok(o) if o.status.success() => {
                    let path_str = worktree_path.to_string_lossy().to_string();
                    caller.data_mut().last_operation_result =
                        Some(path_str.clone().into_bytes());
                    caller.data_mut().last_operation_status = 200;
                    caller.data_mut().new_working_directory = Some(path_str);
                    0
                }
                _ => ERR_GENERIC,
            }
        },
    )?;

    Ok(())
}

fn resolve_against(base: Option<&str>, path: &str) -> String {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return path.to_string();
    }
    match base {
        Some(base) => std::path::Path::new(base)
            .join(p)
            .to_string_lossy()
            .to_string(),
        None => path.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn do_http_request(
    caller: &mut Caller<'_, HostState>,
    method_ptr: u32,
    method_len: u32,
    url_ptr: u32,
    url_len: u32,
    body_ptr: u32,
    body_len: u32,
    headers_ptr: u32,
    headers_len: u32,
) -> u32 {
    let method = match read_mem_string(caller, method_ptr, method_len) {
        Ok(m) => m,
        Err(_) => return ERR_MEMORY_ACCESS,
    };
    let url = match read_mem_string(caller, url_ptr, url_len) {
        Ok(u) => u,
        Err(_) => return ERR_MEMORY_ACCESS,
    };
    let body = if body_len == 0 {
        Vec::new()
    } else {
        match read_mem_bytes(caller, body_ptr, body_len) {
            Ok(b) => b,
            Err(_) => return ERR_MEMORY_ACCESS,
        }
    };
    let extra_headers: HashMap<String, String> = if headers_len == 0 {
        HashMap::new()
    } else {
        match read_mem_string(caller, headers_ptr, headers_len)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(map) => map,
            None => return ERR_INVALID_ARG,
        }
    };

    if !is_url_allowed(&url, &caller.data().allowed_url_prefixes) {
        return ERR_CAPABILITY_DENIED;
    }

    let client = caller.data().http_client.clone();
    let handle = caller.data().runtime_handle.clone();
    let remaining = remaining_budget(caller.data());

    let response = handle.block_on(async move {
        let method = method
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::GET);
        let mut builder = client.request(method.clone(), &url).timeout(remaining);
        for (k, v) in &extra_headers {
            builder = builder.header(k, v);
        }
        if !body.is_empty() && (method == reqwest::Method::POST || method == reqwest::Method::PUT)
        {
            builder = builder
                .header("content-type", "application/json")
                .body(body);
        }
        builder.send().await
    });

    match response {
        Ok(resp) => {
            let status = resp.status().as_u16() as u32;
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_lowercase(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = handle
                .block_on(resp.bytes())
                .map(|b| b.to_vec())
                .unwrap_or_default();
            caller.data_mut().last_response = Some(LastResponse {
                status,
                headers,
                body,
            });
            0
        }
        Err(_) => ERR_UPSTREAM,
    }
}

fn do_execute_target(
    caller: &mut Caller<'_, HostState>,
    kind_ptr: u32,
    kind_len: u32,
    id_ptr: u32,
    id_len: u32,
    params_ptr: u32,
    params_len: u32,
) -> u32 {
    let kind = match read_mem_string(caller, kind_ptr, kind_len) {
        Ok(k) => k,
        Err(_) => return ERR_MEMORY_ACCESS,
    };
    let id = match read_mem_string(caller, id_ptr, id_len) {
        Ok(i) => i,
        Err(_) => return ERR_MEMORY_ACCESS,
    };
    let params = if params_len == 0 {
        serde_json::Value::Null
    } else {
        match read_mem_string(caller, params_ptr, params_len)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(v) => v,
            None => return ERR_INVALID_ARG,
        }
    };
    let kind = match kind.as_str() {
        "workflow" => TargetKind::Workflow,
        "agent" => TargetKind::Agent,
        _ => return ERR_INVALID_ARG,
    };

    let host = Arc::clone(&caller.data().execution_host);
    let handle = caller.data().runtime_handle.clone();
    let result = handle.block_on(host.execute_target(kind, &id, params));

    match result {
        Ok(value) => {
            let bytes = serde_json::to_vec(&value).unwrap_or_default();
            caller.data_mut().last_operation_result = Some(bytes);
            caller.data_mut().last_operation_status = 200;
            0
        }
        Err(err) => {
            caller.data_mut().last_operation_result = Some(err.to_string().into_bytes());
            caller.data_mut().last_operation_status = ERR_UPSTREAM;
            ERR_UPSTREAM
        }
    }
}
