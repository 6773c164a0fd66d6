// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// What kind of memory a finished request leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Chat,
    Pulse,
}

/// External long-term memory subsystem.  The core records the user and
/// assistant turns once per finished request; persistence failures are
/// logged and never fatal.
#[async_trait]
pub trait MemoryRecorder: Send + Sync {
    async fn record(
        &self,
        entity_id: &str,
        request_id: &str,
        kind: MemoryKind,
        user_text: &str,
        assistant_text: &str,
    ) -> anyhow::Result<()>;
}

/// Recorder that remembers nothing.
pub struct NullRecorder;

#[async_trait]
impl MemoryRecorder for NullRecorder {
    async fn record(
        &self,
        _entity_id: &str,
        _request_id: &str,
        _kind: MemoryKind,
        _user_text: &str,
        _assistant_text: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
