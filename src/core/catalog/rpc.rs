// src/core/catalog/rpc.rs

//! JSON-RPC 2.0 envelope plumbing for catalog fetches and pass-through
//! calls: monotonic request ids, request build, and response decode.
//!
//! The core never speaks a transport; envelopes travel to children through
//! the injected `Router` as plain JSON values.

use crate::core::errors::ProcmuxError;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// JSON-RPC error code for a method the peer does not implement.
const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// Builds string request ids of the form `"<prefix>-<method>-<seq>"` with a
/// process-monotonic sequence per builder.
#[derive(Debug)]
pub struct RequestIdBuilder {
    prefix: String,
    seq: AtomicU64,
}

impl Default for RequestIdBuilder {
    fn default() -> Self {
        // A short random prefix keeps ids from different embeddings
        // distinguishable in child logs.
        let prefix = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::with_prefix(prefix)
    }
}

impl RequestIdBuilder {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self, method: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", self.prefix, method, seq)
    }
}

/// Assembles a JSON-RPC 2.0 request envelope.
pub fn build_request(id: &str, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Decodes a JSON-RPC 2.0 response envelope into its result.
///
/// An `error` member decodes into the typed error taxonomy: method-not-found
/// maps to `MethodNotAllowed` (the aggregator treats it as "no such
/// catalog"), everything else — including the well-known URL-elicitation
/// code — surfaces as `Protocol` and is never rendered as a result payload.
pub fn decode_response(response: Value) -> Result<Value, ProcmuxError> {
    let Some(obj) = response.as_object() else {
        return Err(ProcmuxError::InvalidRequest(
            "response is not a JSON object".to_string(),
        ));
    };
    if let Some(err) = obj.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let data = err.get("data").cloned();
        if code == CODE_METHOD_NOT_FOUND {
            return Err(ProcmuxError::MethodNotAllowed(message));
        }
        return Err(ProcmuxError::Protocol {
            code,
            message,
            data,
        });
    }
    Ok(obj.get("result").cloned().unwrap_or(Value::Null))
}
