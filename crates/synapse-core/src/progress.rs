// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// One progress message delivered to subscribers of a request.
///
/// `progress` runs 0..=1; `1` is terminal and is published exactly once per
/// root request.  `data` is a JSON-encoded payload (raw stream event, tool
/// lifecycle record, or the final response text); `info` carries the
/// serialized pathway result data on the terminal event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub request_id: String,
    pub progress: f64,
    pub data: String,
    pub info: String,
    pub error: String,
}

impl ProgressEvent {
    pub fn partial(request_id: impl Into<String>, progress: f64, data: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            progress: progress.min(0.99),
            data: data.into(),
            info: String::new(),
            error: String::new(),
        }
    }

    pub fn terminal(request_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            progress: 1.0,
            data: data.into(),
            info: String::new(),
            error: String::new(),
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.progress >= 1.0
    }
}

/// Pub/sub fan-out of progress events, keyed by request id.
///
/// Publishing is synchronous and never blocks the request task; closed
/// subscribers are dropped on the next publish.  Terminal events clear the
/// subscription entry.
#[derive(Default)]
pub struct ProgressBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ProgressEvent>>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, request_id: &str) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(request_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        let terminal = event.is_terminal();
        if let Some(senders) = subs.get_mut(&event.request_id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
        if terminal {
            subs.remove(&event.request_id);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
