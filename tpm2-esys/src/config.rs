// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Connection settings

use serde::Deserialize;

fn default_max_response_size() -> usize {
    4096
}

fn default_capability_batch() -> u32 {
    64
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TpmConfig {
    /// TPM device path, optionally prefixed with `device:`. The device is
    /// autodetected when unset.
    #[serde(default)]
    pub tcti: Option<String>,
    /// Size of the buffer a response is read into
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    /// Handles requested per TPM2_GetCapability call
    #[serde(default = "default_capability_batch")]
    pub capability_batch: u32,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            tcti: None,
            max_response_size: default_max_response_size(),
            capability_batch: default_capability_batch(),
        }
    }
}

impl TpmConfig {
    pub fn from_tcti(tcti: Option<&str>) -> Self {
        Self {
            tcti: tcti.map(str::to_string),
            ..Default::default()
        }
    }
}
