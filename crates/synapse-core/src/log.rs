// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured NDJSON event log.
//!
//! One JSON object per line, keyed by request id.  These events are the
//! machine-readable audit trail of a request; human-oriented diagnostics go
//! through `tracing` as usual.

use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Event kinds emitted by the executor core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "request.start")]
    RequestStart,
    #[serde(rename = "model.call")]
    ModelCall,
    #[serde(rename = "model.result")]
    ModelResult,
    #[serde(rename = "tool.round")]
    ToolRound,
    #[serde(rename = "tool.exec")]
    ToolExec,
    #[serde(rename = "plan.created")]
    PlanCreated,
    #[serde(rename = "plan.skipped")]
    PlanSkipped,
    #[serde(rename = "plan.step")]
    PlanStep,
    #[serde(rename = "plan.replan")]
    PlanReplan,
    #[serde(rename = "plan.continuation")]
    PlanContinuation,
    #[serde(rename = "compression")]
    Compression,
    #[serde(rename = "callback.entry")]
    CallbackEntry,
    #[serde(rename = "memory.record")]
    MemoryRecord,
    #[serde(rename = "request.end")]
    RequestEnd,
    #[serde(rename = "request.error")]
    RequestError,
}

/// One log line: timestamp, request id, event kind, free-form fields.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub rid: String,
    pub evt: EventKind,
    pub fields: Map<String, Value>,
}

impl LogEvent {
    pub fn new(rid: impl Into<String>, evt: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            rid: rid.into(),
            evt,
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("ts".into(), json!(self.ts.to_rfc3339()));
        obj.insert("rid".into(), json!(self.rid));
        obj.insert(
            "evt".into(),
            serde_json::to_value(self.evt).unwrap_or(Value::Null),
        );
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// Consumer of structured log events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Writes one JSON line per event to any writer (file, stderr, buffer).
pub struct NdjsonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

impl<W: Write + Send> EventSink for NdjsonSink<W> {
    fn emit(&self, event: LogEvent) {
        let line = event.to_json();
        let mut w = self.writer.lock().unwrap();
        // A failed log write must never take the request down with it.
        if let Err(e) = writeln!(w, "{line}") {
            tracing::warn!("ndjson sink write failed: {e}");
        }
    }
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LogEvent) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
