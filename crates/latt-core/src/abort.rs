// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A cheap, cloneable cancellation signal used everywhere a long-running
//! operation needs to be interrupted cooperatively: `waitForInit`, stream
//! starts, MCP connect probes, subprocess terminators.

use tokio::sync::watch;

#[derive(Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the controller calls `abort()`. Resolves immediately,
    /// repeatedly, if already cancelled.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.0.changed().await;
    }
}

pub struct AbortController(watch::Sender<bool>);

impl AbortController {
    pub fn new() -> Self {
        Self(watch::Sender::new(false))
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal(self.0.subscribe())
    }

    pub fn abort(&self) {
        let _ = self.0.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let controller = AbortController::new();
        let mut signal = controller.signal();
        let handle = tokio::spawn(async move {
            signal.cancelled().await;
        });
        controller.abort();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_aborted() {
        let controller = AbortController::new();
        controller.abort();
        let mut signal = controller.signal();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn fresh_signal_is_not_cancelled() {
        let controller = AbortController::new();
        assert!(!controller.signal().is_cancelled());
    }
}
