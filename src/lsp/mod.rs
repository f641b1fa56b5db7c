// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// The clangd child process endpoint.
pub mod clangd;
/// Bidirectional framed JSON-RPC peer.
pub mod peer;
/// LSP message protocol definitions and frame codec.
pub mod protocol;

pub use clangd::{CLANGD_INIT_TIMEOUT, ClangdServer};
pub use peer::{InboundMessage, LspPeer, PeerError, REQUEST_TIMEOUT};
