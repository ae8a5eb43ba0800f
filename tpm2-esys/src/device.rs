// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! The [`Transport`] trait is the only way commands reach a TPM. [`TpmDevice`]
//! implements it over /dev/tpmrm0 or /dev/tpm0.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// Maximum TPM command/response size
pub const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Size of the tag + size + code header shared by commands and responses
pub const HEADER_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open TPM device {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("TPM device not found")]
    NotFound,
    #[error("failed to exchange data with the TPM: {0}")]
    Io(#[from] io::Error),
    #[error("command of {0} bytes exceeds the maximum command size")]
    CommandTooLarge(usize),
    #[error("transport closed")]
    Closed,
}

/// A byte-stream connection to a TPM
pub trait Transport {
    /// Send one complete command and return one complete response
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }
}

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
    max_response_size: usize,
}

impl TpmDevice {
    /// Open a TPM device. A "device:" prefix is accepted and stripped.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        Self::open_with_limit(path, TPM_MAX_COMMAND_SIZE)
    }

    pub fn open_with_limit(path: &str, max_response_size: usize) -> Result<Self, TransportError> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|source| TransportError::Open {
                path: device_path.to_string(),
                source,
            })?;
        debug!(path = device_path, "opened TPM device");

        Ok(Self {
            file,
            path: device_path.to_string(),
            max_response_size,
        })
    }

    /// Detect and open the default TPM device, preferring the resource manager
    pub fn detect() -> Result<Self, TransportError> {
        Self::detect_with_limit(TPM_MAX_COMMAND_SIZE)
    }

    pub fn detect_with_limit(max_response_size: usize) -> Result<Self, TransportError> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open_with_limit("/dev/tpmrm0", max_response_size)
        } else if Path::new("/dev/tpm0").exists() {
            Self::open_with_limit("/dev/tpm0", max_response_size)
        } else {
            Err(TransportError::NotFound)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if command.len() > TPM_MAX_COMMAND_SIZE {
            return Err(TransportError::CommandTooLarge(command.len()));
        }
        self.file.write_all(command)?;

        let mut response = vec![0u8; self.max_response_size];
        let n = self.file.read(&mut response)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        response.truncate(n);
        Ok(response)
    }
}

/// TPM command builder
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    /// Start a command. The tag is chosen by whether an authorization area
    /// follows the handles.
    pub fn new(command_code: TpmCc, with_sessions: bool) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        let tag = if with_sessions {
            TpmSt::Sessions
        } else {
            TpmSt::NoSessions
        };

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code.to_u32());

        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response header and body
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::Unmarshal(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::Unmarshal(format!("invalid response tag: 0x{tag_raw:04x}")))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || response.len() < size {
            return Err(Error::Unmarshal(format!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            )));
        }

        let response_code = buf.get_u32()?;
        let data = response[HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }
}
