// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Mirrors clangd's work-done progress traffic to the IDE, keyed by token.

use lsp_types::{ProgressParams, ProgressParamsValue, ProgressToken, WorkDoneProgress};
use std::collections::HashMap;
use tracing::warn;

/// Lifecycle of one progress token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Token registered via `window/workDoneProgress/create`, no begin yet.
    Unstarted,
    /// Between begin and end.
    Active,
    /// End received.
    Ended,
}

/// Token-keyed state for progress passthrough.
#[derive(Debug, Default)]
pub struct ProgressProxy {
    tokens: HashMap<ProgressToken, ProgressStatus>,
}

impl ProgressProxy {
    /// Creates an empty proxy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token announced by `window/workDoneProgress/create`.
    pub fn create(&mut self, token: ProgressToken) {
        if self
            .tokens
            .insert(token.clone(), ProgressStatus::Unstarted)
            .is_some()
        {
            warn!("progress token {token:?} created twice");
        }
    }

    /// Applies one `$/progress` notification and returns the new status
    /// of its token.
    pub fn update(&mut self, params: &ProgressParams) -> ProgressStatus {
        let ProgressParamsValue::WorkDone(progress) = &params.value;
        let status = match progress {
            WorkDoneProgress::Begin(_) => ProgressStatus::Active,
            WorkDoneProgress::Report(_) => {
                if self.tokens.get(&params.token) != Some(&ProgressStatus::Active) {
                    warn!("progress report for inactive token {:?}", params.token);
                }
                ProgressStatus::Active
            }
            WorkDoneProgress::End(_) => ProgressStatus::Ended,
        };
        self.tokens.insert(params.token.clone(), status);
        status
    }

    /// Current status of a token.
    #[must_use]
    pub fn status(&self, token: &ProgressToken) -> Option<ProgressStatus> {
        self.tokens.get(token).copied()
    }
}
