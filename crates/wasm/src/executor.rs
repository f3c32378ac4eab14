//! The module lifecycle: resolve, merge, compile, instantiate, run,
//! parse stdout, return a structured result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use loom_core::model::merge_maps;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;
use wasmtime::{Config as WasmtimeConfig, Engine, Linker, Module, Store, StoreLimitsBuilder};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::cache::ModuleCache;
use crate::error::{WasmError, WasmResult};
use crate::host_abi::{self, HostState};
use crate::ExecutionHost;

/// Tuning knobs for [`WasmExecutor`]. Defaults mirror the capability
/// profile's defaults (256MB memory, 10M fuel units, 5s timeout).
#[derive(Debug, Clone)]
pub struct WasmExecutorConfig {
    pub memory_limit_bytes: usize,
    pub fuel_limit: u64,
    pub default_timeout: Duration,
    pub allowed_url_prefixes: Vec<String>,
    pub table_elements_limit: usize,
    pub instances_limit: usize,
    pub tables_limit: usize,
    pub memories_limit: usize,
    pub module_cache_capacity: usize,
}

impl Default for WasmExecutorConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 256 * 1024 * 1024,
            fuel_limit: 10_000_000,
            default_timeout: Duration::from_secs(5),
            allowed_url_prefixes: vec!["http://".to_string(), "https://".to_string()],
            table_elements_limit: 10_000,
            instances_limit: 10,
            tables_limit: 10,
            memories_limit: 4,
            module_cache_capacity: 32,
        }
    }
}

/// Structured result of one module execution, matching the contract's
/// `{output, stdout, stderr, success, message, new_working_directory?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmResultValue {
    pub output: serde_json::Value,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub message: String,
    pub new_working_directory: Option<String>,
}

/// Executes WASM modules in single-shot WASI sandboxes.
pub struct WasmExecutor {
    engine: Arc<Engine>,
    cache: ModuleCache,
    config: WasmExecutorConfig,
    execution_host: Arc<dyn ExecutionHost>,
    next_instance_id: AtomicU64,
}

impl std::fmt::Debug for WasmExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmExecutor")
            .field("config", &self.config)
            .field("cached_modules", &self.cache.len())
            .finish()
    }
}

impl WasmExecutor {
    pub fn new(config: WasmExecutorConfig, execution_host: Arc<dyn ExecutionHost>) -> WasmResult<Self> {
        let mut wasm_config = WasmtimeConfig::new();
        wasm_config.wasm_reference_types(true);
        wasm_config.wasm_bulk_memory(true);
        wasm_config.consume_fuel(true);
        wasm_config.epoch_interruption(true);
        wasm_config.memory_guard_size(64 * 1024 * 1024);
        wasm_config.parallel_compilation(false);

        let engine = Arc::new(Engine::new(&wasm_config).map_err(|e| WasmError::Other(e.into()))?);
        let cache = ModuleCache::new(Arc::clone(&engine), config.module_cache_capacity);

        Ok(Self {
            engine,
            cache,
            config,
            execution_host,
            next_instance_id: AtomicU64::new(1),
        })
    }

    /// Drop a compiled module from the cache, e.g. after its bytes are
    /// updated in the store.
    pub fn invalidate_module(&self, module_id: Uuid) {
        self.cache.invalidate(module_id);
    }

    /// Run `module_bytes` (identified by `module_id` for caching) with
    /// `module_config` merged under `input` (input wins on conflict),
    /// in a sandbox scoped to `working_dir` if given, racing the given
    /// `timeout` deadline.
    pub async fn execute(
        &self,
        module_id: Uuid,
        module_bytes: &[u8],
        module_config: serde_json::Value,
        input: serde_json::Value,
        working_dir: Option<String>,
        timeout: Duration,
    ) -> WasmResult<WasmResultValue> {
        if module_bytes.len() < 4 || &module_bytes[0..4] != b"\0asm" {
            return Err(WasmError::InvalidModule(
                "missing WASM magic header".to_string(),
            ));
        }

        let merged_input = merge_maps(&module_config, &input);
        let stdin_json = serde_json::to_string(&merged_input).map_err(|e| WasmError::Other(e.into()))?;

        let module = self.cache.get_or_compile(module_id, module_bytes)?;
        let instance_id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        let engine = Arc::clone(&self.engine);
        let engine_weak = Arc::downgrade(&self.engine);
        let allowed_url_prefixes = self.config.allowed_url_prefixes.clone();
        let memory_limit = self.config.memory_limit_bytes;
        let table_elements_limit = self.config.table_elements_limit;
        let instances_limit = self.config.instances_limit;
        let memories_limit = self.config.memories_limit;
        let tables_limit = self.config.tables_limit;
        let fuel_limit = self.config.fuel_limit;
        let execution_host = Arc::clone(&self.execution_host);
        let runtime_handle = tokio::runtime::Handle::current();

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine_weak.upgrade() {
                            Some(engine) => engine.increment_epoch(),
                            None => break,
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        let run = tokio::task::spawn_blocking(move || -> WasmResult<WasmResultValue> {
            run_module_blocking(
                &engine,
                &module,
                instance_id,
                &stdin_json,
                working_dir,
                allowed_url_prefixes,
                memory_limit,
                table_elements_limit,
                instances_limit,
                memories_limit,
                tables_limit,
                fuel_limit,
                timeout,
                deadline,
                execution_host,
                runtime_handle,
            )
        });

        let result = match tokio::time::timeout_at(deadline.into(), run).await {
            Ok(join_result) => join_result.map_err(|e| WasmError::Other(e.into()))?,
            Err(_) => {
                let _ = stop_tx.send(());
                let _ = ticker.await;
                return Err(WasmError::Deadline);
            }
        };

        let _ = stop_tx.send(());
        let _ = ticker.await;
        result
    }
}

#[allow(clippy::too_many_arguments)]
fn run_module_blocking(
    engine: &Engine,
    module: &Module,
    instance_id: u64,
    stdin_json: &str,
    working_dir: Option<String>,
    allowed_url_prefixes: Vec<String>,
    memory_limit: usize,
    table_elements_limit: usize,
    instances_limit: usize,
    memories_limit: usize,
    tables_limit: usize,
    fuel_limit: u64,
    timeout: Duration,
    deadline: Instant,
    execution_host: Arc<dyn ExecutionHost>,
    runtime_handle: tokio::runtime::Handle,
) -> WasmResult<WasmResultValue> {
    let mut wasi_builder = WasiCtxBuilder::new();

    if let Some(dir) = &working_dir {
        if std::path::Path::new(dir).is_dir() {
            wasi_builder
                .preopened_dir(dir, ".", DirPerms::all(), FilePerms::all())
                .map_err(|e| WasmError::Other(e))?;
        }
    }

    let stdin_pipe = MemoryInputPipe::new(stdin_json.as_bytes().to_vec());
    let stdout_pipe = MemoryOutputPipe::new(4 * 1024 * 1024);
    let stderr_pipe = MemoryOutputPipe::new(1024 * 1024);
    let stdout_reader = stdout_pipe.clone();
    let stderr_reader = stderr_pipe.clone();

    wasi_builder.stdin(stdin_pipe).stdout(stdout_pipe).stderr(stderr_pipe);
    let wasi: WasiP1Ctx = wasi_builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(memory_limit)
        .table_elements(table_elements_limit)
        .instances(instances_limit)
        .memories(memories_limit)
        .tables(tables_limit)
        .trap_on_grow_failure(false)
        .build();

    let host_state = HostState {
        wasi,
        limits,
        instance_id,
        allowed_url_prefixes,
        working_dir,
        new_working_directory: None,
        last_response: None,
        last_operation_result: None,
        last_operation_status: 0,
        deadline,
        execution_host,
        runtime_handle,
        http_client: reqwest::Client::new(),
    };

    let mut store = Store::new(engine, host_state);
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(fuel_limit)
        .map_err(|e| WasmError::Other(e))?;
    let deadline_ticks = u64::try_from(timeout.as_millis() / 100).unwrap_or(u64::MAX).max(1);
    store.set_epoch_deadline(deadline_ticks);

    let mut linker: Linker<HostState> = Linker::new(engine);
    wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |s: &mut HostState| &mut s.wasi)
        .map_err(|e| WasmError::Instantiation(e.to_string()))?;
    host_abi::add_to_linker(&mut linker).map_err(|e| WasmError::Instantiation(e.to_string()))?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| WasmError::Instantiation(e.to_string()))?;

    if let Some(init) = instance.get_func(&mut store, "_initialize") {
        init.call(&mut store, &[], &mut [])
            .map_err(|e| WasmError::Instantiation(format!("_initialize failed: {e}")))?;
    }

    let Some(start) = instance.get_func(&mut store, "_start") else {
        return Err(WasmError::Instantiation(
            "module has no _start entry point".to_string(),
        ));
    };

    let exec_result = start.call(&mut store, &[], &mut []);

    let stdout_bytes = stdout_reader.contents();
    let stderr_bytes = stderr_reader.contents();
    let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
    let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();
    let new_working_directory = store.data().new_working_directory.clone();

    match exec_result {
        Ok(()) => {
            debug!(instance_id, "module executed successfully");
            let output = parse_stdout(&stdout);
            Ok(WasmResultValue {
                output,
                stdout,
                stderr,
                success: true,
                message: "WASM module executed successfully".to_string(),
                new_working_directory,
            })
        }
        Err(trap) if is_normal_exit(&trap) => {
            let output = parse_stdout(&stdout);
            Ok(WasmResultValue {
                output,
                stdout,
                stderr,
                success: true,
                message: "WASM module executed successfully".to_string(),
                new_working_directory,
            })
        }
        Err(trap) => {
            warn!(instance_id, error = %trap, "module execution failed");
            Err(WasmError::Upstream(format!("{trap}\n{stderr}")))
        }
    }
}

/// The managed-GC toolchains this executor targets exit the WASI
/// `_start` entry point by trapping with `proc_exit(0)`; wasmtime
/// surfaces that as an `I32Exit(0)` error rather than a normal return.
fn is_normal_exit(trap: &anyhow::Error) -> bool {
    trap.downcast_ref::<wasmtime_wasi::I32Exit>()
        .is_some_and(|exit| exit.0 == 0)
}

/// Per the module contract: valid JSON with a `message` field yields
/// that field as `output`; valid JSON otherwise yields the whole
/// object; non-JSON yields the raw string.
fn parse_stdout(stdout: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(stdout) {
        Ok(serde_json::Value::Object(map)) => map
            .get("message")
            .cloned()
            .unwrap_or(serde_json::Value::Object(map)),
        Ok(other) => other,
        Err(_) => serde_json::Value::String(stdout.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    struct NoopHost;

    #[async_trait::async_trait]
    impl ExecutionHost for NoopHost {
        async fn execute_target(
            &self,
            _kind: crate::TargetKind,
            _id: &str,
            _params: serde_json::Value,
        ) -> WasmResult<serde_json::Value> {
            Ok(serde_json::json!({"ok": true}))
        }

        async fn get_job_output(&self, _job_id: Uuid) -> WasmResult<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn wait_for_job_output(
            &self,
            _job_id: Uuid,
            _deadline: StdInstant,
        ) -> WasmResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x04, 0x01, 0x60, 0x00, 0x00, 0x03,
        0x02, 0x01, 0x00, 0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00, 0x00,
        0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b,
    ];

    #[test]
    fn parse_stdout_extracts_message_field() {
        let value = parse_stdout(r#"{"message": "hi", "other": 1}"#);
        assert_eq!(value, serde_json::json!("hi"));
    }

    #[test]
    fn parse_stdout_passes_through_object_without_message() {
        let value = parse_stdout(r#"{"foo": "bar"}"#);
        assert_eq!(value, serde_json::json!({"foo": "bar"}));
    }

    #[test]
    fn parse_stdout_falls_back_to_raw_string() {
        let value = parse_stdout("not json");
        assert_eq!(value, serde_json::json!("not json"));
    }

    #[tokio::test]
    async fn executes_minimal_module_with_empty_stdout() {
        let executor =
            WasmExecutor::new(WasmExecutorConfig::default(), Arc::new(NoopHost)).unwrap();
        let result = executor
            .execute(
                Uuid::new_v4(),
                MINIMAL_WASM,
                serde_json::json!({}),
                serde_json::json!({}),
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn rejects_bytes_without_wasm_magic_header() {
        let executor =
            WasmExecutor::new(WasmExecutorConfig::default(), Arc::new(NoopHost)).unwrap();
        let err = executor
            .execute(
                Uuid::new_v4(),
                b"not wasm",
                serde_json::json!({}),
                serde_json::json!({}),
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WasmError::InvalidModule(_)));
    }
}
