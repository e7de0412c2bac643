// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend configuration.
//!
//! The owning agent hands the backend a [`BackendInitParams`] with a free-form
//! key/value map. [`BackendConfig::from_init`] extracts the keys this backend
//! understands:
//! - `device_list`: comma separated list of transport devices (default: all)
//! - `num_workers`: number of transport workers (default: 1)
//! - `ucx_error_handling_mode`: `none` or `peer` (default: `none`)
//!
//! The device-address workaround can be disabled with
//! `DYN_UCX_DISABLE_CUDA_ADDR_WA=1`.

use std::collections::HashMap;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::backend::BackendInitParams;
use crate::sync::ThreadSync;
use crate::transport::TransportParams;

/// Environment variable that disables the device-address workaround.
pub const ENV_DISABLE_CUDA_ADDR_WA: &str = "DYN_UCX_DISABLE_CUDA_ADDR_WA";

pub const PARAM_DEVICE_LIST: &str = "device_list";
pub const PARAM_NUM_WORKERS: &str = "num_workers";
pub const PARAM_ERROR_HANDLING_MODE: &str = "ucx_error_handling_mode";

/// Default progress thread poll delay.
pub const DEFAULT_PROGRESS_DELAY: Duration = Duration::from_micros(100_000);

const DEFAULT_NUM_WORKERS: usize = 1;

/// Endpoint failure handling requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingMode {
    #[default]
    None,
    Peer,
}

impl ErrorHandlingMode {
    fn parse(value: &str) -> Self {
        match value {
            "peer" => ErrorHandlingMode::Peer,
            _ => ErrorHandlingMode::None,
        }
    }
}

/// Resolved configuration for one backend engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(pattern = "owned")]
pub struct BackendConfig {
    /// Transport devices to open; empty means all.
    #[builder(default)]
    pub device_list: Vec<String>,

    #[builder(default = "DEFAULT_NUM_WORKERS")]
    pub num_workers: usize,

    #[builder(default)]
    pub error_handling: ErrorHandlingMode,

    /// Run a dedicated progress thread instead of caller-driven progress.
    #[builder(default)]
    pub progress_thread: bool,

    /// Upper bound on how long the progress thread sleeps between sweeps.
    #[builder(default = "DEFAULT_PROGRESS_DELAY")]
    pub progress_delay: Duration,

    #[builder(default)]
    pub thread_sync: ThreadSync,

    /// Verify device addresses against the accelerator runtime and track its context.
    #[builder(default = "cuda_address_workaround_from_env()")]
    pub cuda_address_workaround: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            device_list: Vec::new(),
            num_workers: DEFAULT_NUM_WORKERS,
            error_handling: ErrorHandlingMode::None,
            progress_thread: false,
            progress_delay: DEFAULT_PROGRESS_DELAY,
            thread_sync: ThreadSync::default(),
            cuda_address_workaround: cuda_address_workaround_from_env(),
        }
    }
}

impl BackendConfig {
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::default()
    }

    /// Build the configuration from agent supplied init parameters.
    pub fn from_init(init: &BackendInitParams) -> Self {
        let params = &init.custom_params;

        let device_list = params
            .get(PARAM_DEVICE_LIST)
            .map(|devs| split_device_list(devs))
            .unwrap_or_default();

        let num_workers = match params.get(PARAM_NUM_WORKERS) {
            None => DEFAULT_NUM_WORKERS,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        "invalid {PARAM_NUM_WORKERS}, using {DEFAULT_NUM_WORKERS}"
                    );
                    DEFAULT_NUM_WORKERS
                }
            },
        };

        let error_handling = params
            .get(PARAM_ERROR_HANDLING_MODE)
            .map(|mode| ErrorHandlingMode::parse(mode))
            .unwrap_or_default();

        Self {
            device_list,
            num_workers,
            error_handling,
            progress_thread: init.enable_progress_thread,
            progress_delay: init.progress_delay,
            thread_sync: init.thread_sync,
            cuda_address_workaround: cuda_address_workaround_from_env(),
        }
    }

    /// Option keys understood by this backend, with their defaults.
    pub fn default_params() -> HashMap<String, String> {
        HashMap::from([
            (PARAM_DEVICE_LIST.to_string(), String::new()),
            (PARAM_NUM_WORKERS.to_string(), DEFAULT_NUM_WORKERS.to_string()),
            (PARAM_ERROR_HANDLING_MODE.to_string(), "none".to_string()),
        ])
    }

    /// Progress thread poll timeout in milliseconds: the delay rounded up,
    /// at least 1ms and small enough for `poll(2)`.
    pub fn poll_timeout_ms(&self) -> i32 {
        let micros = self.progress_delay.as_micros();
        micros.div_ceil(1000).clamp(1, i32::MAX as u128) as i32
    }

    /// Workers to create; a configured 0 means 1.
    pub fn worker_count(&self) -> usize {
        self.num_workers.max(DEFAULT_NUM_WORKERS)
    }

    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            devices: self.device_list.clone(),
            error_handling: self.error_handling,
            multi_threaded: self.progress_thread,
            num_workers: self.worker_count(),
        }
    }
}

fn split_device_list(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .filter(|dev| !dev.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check if a string is truthy: "1", "true", "on", "yes" (case-insensitive).
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Parse a string as a boolean, returning an error if it is neither truthy nor falsey.
pub fn parse_bool(val: &str) -> anyhow::Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no") {
        Ok(false)
    } else {
        anyhow::bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

fn cuda_address_workaround_from_env() -> bool {
    match std::env::var(ENV_DISABLE_CUDA_ADDR_WA) {
        Ok(val) => match parse_bool(&val) {
            Ok(disabled) => {
                if disabled {
                    tracing::info!("disabling CUDA address workaround");
                }
                !disabled
            }
            Err(e) => {
                tracing::warn!("ignoring {ENV_DISABLE_CUDA_ADDR_WA}: {e}");
                true
            }
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn init_with(params: &[(&str, &str)]) -> BackendInitParams {
        BackendInitParams {
            local_agent: "agent-0".to_string(),
            custom_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = BackendConfig::from_init(&init_with(&[]));
        assert!(config.device_list.is_empty());
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.error_handling, ErrorHandlingMode::None);
        assert!(!config.progress_thread);
    }

    #[test]
    fn test_device_list_split() {
        let config = BackendConfig::from_init(&init_with(&[("device_list", "mlx5_0, mlx5_1")]));
        assert_eq!(config.device_list, vec!["mlx5_0", "mlx5_1"]);
    }

    #[rstest]
    #[case("4", 4)]
    #[case(" 2 ", 2)]
    #[case("0", 1)]
    #[case("-3", 1)]
    #[case("many", 1)]
    fn test_num_workers(#[case] raw: &str, #[case] expected: usize) {
        let config = BackendConfig::from_init(&init_with(&[("num_workers", raw)]));
        assert_eq!(config.num_workers, expected);
    }

    #[rstest]
    #[case("peer", ErrorHandlingMode::Peer)]
    #[case("none", ErrorHandlingMode::None)]
    #[case("PEER", ErrorHandlingMode::None)]
    fn test_error_handling_mode(#[case] raw: &str, #[case] expected: ErrorHandlingMode) {
        let config = BackendConfig::from_init(&init_with(&[("ucx_error_handling_mode", raw)]));
        assert_eq!(config.error_handling, expected);
    }

    #[rstest]
    #[case(Duration::ZERO, 1)]
    #[case(Duration::from_micros(1), 1)]
    #[case(Duration::from_micros(1500), 2)]
    #[case(Duration::from_millis(100), 100)]
    #[case(Duration::from_secs(u64::MAX / 4), i32::MAX)]
    fn test_poll_timeout_clamped(#[case] delay: Duration, #[case] expected: i32) {
        let config = BackendConfig::builder()
            .progress_delay(delay)
            .build()
            .unwrap();
        assert_eq!(config.poll_timeout_ms(), expected);
    }

    #[test]
    fn test_zero_workers_means_one() {
        let config = BackendConfig::builder().num_workers(0).build().unwrap();
        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.transport_params().num_workers, 1);

        let config = BackendConfig::builder().num_workers(4).build().unwrap();
        assert_eq!(config.transport_params().num_workers, 4);
    }

    #[test]
    fn test_init_flags_carry_over() {
        let init = BackendInitParams {
            enable_progress_thread: true,
            progress_delay: Duration::from_millis(5),
            thread_sync: ThreadSync::ReaderWriter,
            ..init_with(&[("num_workers", "3")])
        };
        let config = BackendConfig::from_init(&init);
        assert!(config.progress_thread);
        assert_eq!(config.progress_delay, Duration::from_millis(5));
        assert_eq!(config.thread_sync, ThreadSync::ReaderWriter);

        let params = config.transport_params();
        assert!(params.multi_threaded);
        assert_eq!(params.num_workers, 3);
    }

    #[test]
    fn test_default_params_lists_known_keys() {
        let params = BackendConfig::default_params();
        assert_eq!(params.get("num_workers").map(String::as_str), Some("1"));
        assert!(params.contains_key("device_list"));
        assert!(params.contains_key("ucx_error_handling_mode"));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("yes").unwrap());
        assert!(!parse_bool("Off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
