// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolve a (possibly relative) config path against the current working
/// directory and canonicalize it.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Like [`resolve_config_path`], but lets an environment variable override
/// the default location. Used by the test suites to point at alternative
/// fixtures.
pub fn resolve_config_path_env(var: &str, fallback: &str) -> Result<PathBuf> {
    let rel = std::env::var(var).unwrap_or_else(|_| fallback.to_string());
    resolve_config_path(&rel)
}
