// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for binaries and tests embedding the backend.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `DYN_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters are read from the `DYN_LOG` environment variable using the usual
//! `EnvFilter` directive syntax (e.g. `dynamo_ucx=debug`). The default level is `info`.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::is_truthy;

pub const DYN_LOG: &str = "DYN_LOG";
pub const DYN_LOGGING_JSONL: &str = "DYN_LOGGING_JSONL";
pub const DYN_DISABLE_ANSI_LOGGING: &str = "DYN_DISABLE_ANSI_LOGGING";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = setup_logging() {
            eprintln!("Failed to initialize logging: {e}");
        }
    });
}

fn env_is_truthy(key: &str) -> bool {
    std::env::var(key).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn filters() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(DYN_LOG)
        .from_env_lossy()
}

fn setup_logging() -> anyhow::Result<()> {
    if env_is_truthy(DYN_LOGGING_JSONL) {
        let l = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .with_filter(filters());
        tracing_subscriber::registry().with(l).try_init()?;
    } else {
        let l = fmt::layer()
            .compact()
            .with_ansi(!env_is_truthy(DYN_DISABLE_ANSI_LOGGING))
            .with_writer(std::io::stderr)
            .with_filter(filters());
        tracing_subscriber::registry().with(l).try_init()?;
    }
    Ok(())
}
