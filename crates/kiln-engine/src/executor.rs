//! Script engine — creates fresh V8 isolates and runs agent-submitted code.
//!
//! Each execution gets a brand new runtime; nothing is shared or reused
//! between requests. V8 isolates are `!Send`, so all JsRuntime operations
//! run on a dedicated thread with its own single-threaded tokio runtime.
//! The public API is fully async and `Send`-safe.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions, StaticModuleLoader};
use tokio_util::sync::CancellationToken;

use crate::bundler::{Bundle, Workspace};
use crate::dispatch::ToolDispatcher;
use crate::error::EngineError;
use crate::fetch::FetchPolicy;
use crate::ops::{kiln_ext, Cancellation, OutputBuffers, ToolTrace};
use crate::types::{
    ExecutionRequest, ExecutionResult, EXIT_ERROR, EXIT_OK, EXIT_TIMEOUT, SUPPORTED_LANGUAGE,
};

/// Configuration for the script engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the pre-generated tool wrapper workspace.
    pub workspace_root: PathBuf,
    /// Timeout applied when a request carries none of its own.
    pub default_timeout: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum size of submitted code in bytes.
    pub max_code_size: usize,
    /// Service namespaces visible to scripts as the `interfaces` global.
    pub interfaces: Vec<String>,
}

impl EngineConfig {
    /// Defaults for everything but the workspace root.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            default_timeout: Duration::from_secs(30),
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_code_size: 256 * 1024,       // 256 KB
            interfaces: Vec::new(),
        }
    }

    /// Build from loaded settings, taking defaults for anything unset.
    pub fn from_settings(settings: &kiln_config::KilnConfig) -> Self {
        let mut config = Self::new(&settings.workspace_root);
        if let Some(secs) = settings.engine.default_timeout_secs {
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = settings.engine.max_heap_mb {
            config.max_heap_size = mb * 1024 * 1024;
        }
        if let Some(kb) = settings.engine.max_code_kb {
            config.max_code_size = kb * 1024;
        }
        config
    }
}

/// The sandboxed script execution engine.
///
/// One instance serves many concurrent executions; each execution gets its
/// own V8 isolate, output buffers, tool trace, and transient entry file, so
/// no locking exists between them. This is `Send + Sync` safe — all V8 work
/// is dispatched to a dedicated thread internally.
pub struct ScriptEngine {
    config: EngineConfig,
    workspace: Workspace,
    dispatcher: Arc<dyn ToolDispatcher>,
}

/// How one VM run ended.
enum Termination {
    /// Ran to the end of the bundled unit without raising.
    Completed,
    /// V8 rejected the bundle before user code ran.
    CompileFailed(String),
    /// An uncaught error propagated to the top.
    Raised(String),
    /// The timeout supervisor forced the VM to stop.
    Interrupted,
}

/// Everything the VM phase produces, handed to the result collector.
struct VmOutcome {
    termination: Termination,
    stdout: String,
    stderr: String,
    tools_called: Vec<String>,
    duration: Duration,
}

impl ScriptEngine {
    /// Create an engine over the given workspace and dispatch target.
    ///
    /// The dispatch target is fixed for the life of the engine.
    pub fn new(
        config: EngineConfig,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<Self, EngineError> {
        let workspace = Workspace::open(&config.workspace_root)?;
        Ok(Self {
            config,
            workspace,
            dispatcher,
        })
    }

    /// Execute one submitted script to completion, error, or timeout.
    ///
    /// Script-level failures are encoded in the returned result; only
    /// engine-infrastructure failures surface as `Err`.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), with caller-supplied cancellation
    /// that propagates into in-flight tool calls and fetches.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        tracing::info!(
            code_len = request.code.len(),
            language = %request.language,
            timeout_seconds = request.timeout_seconds,
            "execute: starting"
        );

        if !request.language.is_empty() && request.language != SUPPORTED_LANGUAGE {
            return Ok(rejected(format!(
                "unsupported language '{}', only '{}' is supported",
                request.language, SUPPORTED_LANGUAGE
            )));
        }

        if request.code.len() > self.config.max_code_size {
            return Ok(rejected(format!(
                "code exceeds maximum size of {} bytes (got {})",
                self.config.max_code_size,
                request.code.len()
            )));
        }

        let timeout = if request.timeout_seconds == 0 {
            self.config.default_timeout
        } else {
            Duration::from_secs(request.timeout_seconds)
        };

        // Staged entry lives until the VM phase is over; Drop removes it on
        // every path out of this function.
        let staged = self.workspace.stage_entry(&request.code)?;

        let bundle = match self.workspace.bundle(&staged) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(error = %e, "execute: bundling failed");
                return Ok(rejected(format!("transpile error: {e}")));
            }
        };

        let dispatcher = self.dispatcher.clone();
        let interfaces = serde_json::to_string(&self.config.interfaces)
            .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
        let max_heap_size = self.config.max_heap_size;

        // V8 isolates are !Send — run the whole VM phase on a dedicated thread
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(EngineError::Infrastructure(e.to_string()))).is_err() {
                        tracing::warn!("execution result receiver dropped");
                    }
                    return;
                }
            };
            let outcome = rt.block_on(run_vm(
                bundle,
                dispatcher,
                interfaces,
                max_heap_size,
                timeout,
                cancel,
            ));
            if tx.send(Ok(outcome)).is_err() {
                tracing::warn!("execution result receiver dropped before result was sent");
            }
        });

        let outcome = rx
            .await
            .map_err(|_| EngineError::Infrastructure("sandbox thread panicked".into()))??;

        drop(staged);

        let result = collect(outcome, timeout);
        match result.exit_code {
            EXIT_OK => tracing::info!("execute: complete"),
            code => tracing::warn!(exit_code = code, error = %result.error, "execute: failed"),
        }
        Ok(result)
    }
}

/// Build a pre-VM rejection result.
fn rejected(error: String) -> ExecutionResult {
    ExecutionResult {
        exit_code: EXIT_ERROR,
        error,
        ..Default::default()
    }
}

/// Assemble the final result record. Terminal step; never fails.
fn collect(outcome: VmOutcome, timeout: Duration) -> ExecutionResult {
    let (exit_code, error) = match outcome.termination {
        Termination::Completed => (EXIT_OK, String::new()),
        Termination::CompileFailed(msg) => (EXIT_ERROR, format!("transpile error: {msg}")),
        Termination::Raised(msg) => (EXIT_ERROR, msg),
        Termination::Interrupted => (
            EXIT_TIMEOUT,
            format!("execution timed out after {}s", timeout.as_secs()),
        ),
    };
    ExecutionResult {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code,
        execution_time_seconds: outcome.duration.as_secs_f64(),
        tools_called: outcome.tools_called,
        error,
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. AtomicBool lets the
    /// callback work through a shared `&` reference, eliminating aliasing
    /// concerns.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the Box<HeapLimitState> allocated in run_vm,
    // which stays alive until run_vm removes this callback from the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run one bundled unit in a fresh isolate on the current thread.
///
/// Must be called from the dedicated VM thread, not the main tokio runtime.
async fn run_vm(
    bundle: Bundle,
    dispatcher: Arc<dyn ToolDispatcher>,
    interfaces_json: String,
    max_heap_size: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> VmOutcome {
    let loader = Rc::new(StaticModuleLoader::new(bundle.modules));
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(loader),
        extensions: vec![kiln_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(dispatcher);
        state.put(Cancellation(cancel));
        state.put(FetchPolicy);
        state.put(reqwest::Client::new());
        state.put(OutputBuffers::default());
        state.put(ToolTrace::default());
    }

    // --- Install the capability bridge before any user code runs ---
    if let Err(e) = runtime.execute_script("[kiln:bootstrap]", build_bootstrap(&interfaces_json)) {
        return VmOutcome {
            termination: Termination::Raised(e.to_string()),
            stdout: String::new(),
            stderr: String::new(),
            tools_called: Vec::new(),
            duration: Duration::ZERO,
        };
    }

    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Arm the timeout supervisor ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let interrupt_handle = runtime.v8_isolate().thread_safe_handle();
    let start = Instant::now();

    // --- Load and evaluate the bundled unit ---
    let mut compile_failed: Option<String> = None;
    let mut exec_error: Option<String> = None;

    match runtime.load_main_es_module(&bundle.entry).await {
        Err(e) => compile_failed = Some(e.to_string()),
        Ok(mod_id) => {
            let eval = runtime.mod_evaluate(mod_id);
            match tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => {
                    if let Err(e) = eval.await {
                        exec_error = Some(e.to_string());
                    }
                }
                Ok(Err(e)) => exec_error = Some(e.to_string()),
                Err(_) => {
                    // Async-hang case: nothing on the V8 stack to terminate,
                    // but treat it exactly like a watchdog interrupt.
                    timed_out.store(true, Ordering::SeqCst);
                    interrupt_handle.terminate_execution();
                    exec_error = Some("event loop deadline exceeded".to_string());
                }
            }
        }
    }

    let duration = start.elapsed();

    // --- Stop the supervisor before dropping the runtime ---
    // Joining guarantees the watchdog can no longer touch the IsolateHandle,
    // and removing the heap callback guarantees V8 can no longer touch
    // `heap_state` once it goes out of scope.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    // --- Classify in priority order ---
    let termination = if heap_state.triggered.load(Ordering::SeqCst) {
        Termination::Raised("V8 heap limit exceeded".to_string())
    } else if timed_out.load(Ordering::SeqCst) {
        Termination::Interrupted
    } else if let Some(msg) = compile_failed {
        Termination::CompileFailed(msg)
    } else if let Some(msg) = exec_error {
        Termination::Raised(msg)
    } else {
        Termination::Completed
    };

    finish_vm(&mut runtime, termination, duration)
}

/// Pull the captured buffers and trace out of OpState and close the outcome.
fn finish_vm(runtime: &mut JsRuntime, termination: Termination, duration: Duration) -> VmOutcome {
    let (stdout, stderr, tools_called) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let buffers = state.take::<OutputBuffers>();
        let trace = state.take::<ToolTrace>();
        (buffers.stdout, buffers.stderr, trace.0)
    };
    VmOutcome {
        termination,
        stdout,
        stderr,
        tools_called,
        duration,
    }
}

/// Build the bootstrap script that installs the capability bridge.
///
/// Ops are captured in closures, the bridge globals are frozen, and then
/// `Deno` plus the code-generation primitives are removed so nothing outside
/// the four capabilities is reachable, even via prototype chains.
fn build_bootstrap(interfaces_json: &str) -> String {
    format!(
        r#"
        ((ops) => {{
            const callToolOp = ops.op_kiln_call_tool;
            const searchToolsOp = ops.op_kiln_search_tools;
            const fetchOp = ops.op_kiln_fetch;
            const writeOp = (stream, line) => ops.op_kiln_console(stream, line);

            const fmt = (args) => args.map((a) => {{
                if (typeof a === "string") return a;
                const s = JSON.stringify(a);
                return s === undefined ? String(a) : s;
            }}).join(" ");

            globalThis.console = Object.freeze({{
                log: (...args) => writeOp(0, fmt(args)),
                warn: (...args) => writeOp(1, fmt(args)),
                error: (...args) => writeOp(1, fmt(args)),
            }});

            globalThis.callTool = async (tool, args) => {{
                const resultJson = await callToolOp(String(tool), JSON.stringify(args || {{}}));
                return JSON.parse(resultJson);
            }};

            globalThis.searchTools = async (query, detail) => {{
                const resultJson = await searchToolsOp(
                    String(query), detail == null ? "" : String(detail)
                );
                return JSON.parse(resultJson);
            }};

            globalThis.fetch = async (url, options) => {{
                const raw = await fetchOp(String(url), JSON.stringify(options || {{}}));
                const r = JSON.parse(raw);
                return {{
                    ok: r.ok,
                    status: r.status,
                    statusText: r.statusText,
                    text: async () => r.body,
                    json: async () => JSON.parse(r.body),
                }};
            }};

            globalThis.interfaces = Object.freeze({interfaces_json});

            delete globalThis.Deno;

            // Remove code generation primitives to prevent prototype chain
            // attacks reaching Function via e.g. console.log.constructor.
            delete globalThis.eval;
            const AsyncFunction = (async function(){{}}).constructor;
            const GeneratorFunction = (function*(){{}}).constructor;
            Object.defineProperty(Function.prototype, 'constructor', {{
                value: undefined, configurable: false, writable: false
            }});
            Object.defineProperty(AsyncFunction.prototype, 'constructor', {{
                value: undefined, configurable: false, writable: false
            }});
            Object.defineProperty(GeneratorFunction.prototype, 'constructor', {{
                value: undefined, configurable: false, writable: false
            }});
        }})(Deno.core.ops);
        "#
    )
}
