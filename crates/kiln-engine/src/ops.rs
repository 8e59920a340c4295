//! deno_core op definitions for the Kiln capability bridge.
//!
//! These four ops are the entire surface through which sandboxed code can
//! affect the outside world. Everything else a script might reach for —
//! filesystem, environment, process control, unrestricted network — simply
//! does not exist inside the isolate.
//!
//! The `#[op2]` macro generates additional public items (v8 function
//! pointers, metadata structs) that cannot carry doc comments, so
//! `missing_docs` is suppressed at module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DetailLevel, ToolDispatcher};
use crate::fetch::{FetchOptions, FetchPolicy};

/// Captured stdout/stderr for one execution, stored in OpState.
#[derive(Default)]
pub struct OutputBuffers {
    /// Accumulated `console.log` lines.
    pub stdout: String,
    /// Accumulated `console.warn`/`console.error` lines.
    pub stderr: String,
}

/// Ordered trace of tool names invoked during one execution.
#[derive(Default)]
pub struct ToolTrace(pub Vec<String>);

/// Caller-supplied cancellation observed by the I/O-performing ops.
pub struct Cancellation(pub CancellationToken);

/// Stream index for `op_kiln_console`: everything non-zero is stderr.
const STREAM_STDOUT: u32 = 0;

/// Append one newline-terminated line to the captured output.
#[op2(fast)]
pub fn op_kiln_console(state: &mut OpState, #[smi] stream: u32, #[string] line: &str) {
    let buffers = state.borrow_mut::<OutputBuffers>();
    let target = if stream == STREAM_STDOUT {
        &mut buffers.stdout
    } else {
        &mut buffers.stderr
    };
    target.push_str(line);
    target.push('\n');
}

/// Invoke a tool through the configured dispatch target.
///
/// The tool name is recorded in the trace before dispatch, so failed calls
/// are traced exactly like successful ones. The call blocks the script until
/// the dispatch completes or the caller's cancellation fires — nothing else
/// runs inside the VM meanwhile, which is the whole point.
#[op2]
#[string]
pub async fn op_kiln_call_tool(
    op_state: Rc<RefCell<OpState>>,
    #[string] tool: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(tool = %tool, args_len = args_json.len(), "tool call dispatched");

    let (dispatcher, cancel) = {
        let mut st = op_state.borrow_mut();
        st.borrow_mut::<ToolTrace>().0.push(tool.clone());
        (
            st.borrow::<Arc<dyn ToolDispatcher>>().clone(),
            st.borrow::<Cancellation>().0.clone(),
        )
    };

    let args: serde_json::Value = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid JSON args: {e}")))?;

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(JsErrorBox::generic(format!("tool call '{tool}' cancelled")));
        }
        r = dispatcher.call_tool(&tool, args) => {
            r.map_err(|e| JsErrorBox::generic(e.to_string()))?
        }
    };

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Search the tool catalog through the configured dispatch target.
///
/// Not recorded in the tool trace — only invocations are.
#[op2]
#[string]
pub async fn op_kiln_search_tools(
    op_state: Rc<RefCell<OpState>>,
    #[string] query: String,
    #[string] detail: String,
) -> Result<String, JsErrorBox> {
    let detail = DetailLevel::parse(&detail);
    tracing::debug!(query = %query, detail = detail.as_str(), "tool search dispatched");

    let (dispatcher, cancel) = {
        let st = op_state.borrow();
        (
            st.borrow::<Arc<dyn ToolDispatcher>>().clone(),
            st.borrow::<Cancellation>().0.clone(),
        )
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(JsErrorBox::generic("tool search cancelled".to_string()));
        }
        r = dispatcher.search_tools(&query, detail) => {
            r.map_err(|e| JsErrorBox::generic(e.to_string()))?
        }
    };

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Loopback-only fetch.
#[op2]
#[string]
pub async fn op_kiln_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] options_json: String,
) -> Result<String, JsErrorBox> {
    let (client, policy, cancel) = {
        let st = op_state.borrow();
        (
            st.borrow::<reqwest::Client>().clone(),
            st.borrow::<FetchPolicy>().clone(),
            st.borrow::<Cancellation>().0.clone(),
        )
    };

    let options: FetchOptions = serde_json::from_str(&options_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid fetch options: {e}")))?;

    tracing::debug!(url = %url, "fetch dispatched");

    let response = crate::fetch::perform(&client, &policy, &url, options, &cancel)
        .await
        .map_err(JsErrorBox::generic)?;

    serde_json::to_string(&response)
        .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

deno_core::extension!(
    kiln_ext,
    ops = [
        op_kiln_console,
        op_kiln_call_tool,
        op_kiln_search_tools,
        op_kiln_fetch
    ],
);
