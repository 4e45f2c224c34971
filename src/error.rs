// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for courier operations

use std::fmt;

/// Error codes reported alongside courier failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    OutOfMemory = 1,
    Invalid = 2,
    IoError = 3,
    NotImplemented = 4,
    DeviceError = 5,
    ExecutionError = 6,
    UnknownError = 7,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::OutOfMemory => write!(f, "Out of memory"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::DeviceError => write!(f, "Device error"),
            Code::ExecutionError => write!(f, "Execution error"),
            Code::UnknownError => write!(f, "Unknown error"),
        }
    }
}

/// Main error type for courier operations
#[derive(thiserror::Error, Debug)]
pub enum CourierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl CourierError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        CourierError::Generic {
            code,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CourierError::Io(_) => Code::IoError,
            CourierError::Invalid(_) => Code::Invalid,
            CourierError::NotImplemented(_) => Code::NotImplemented,
            CourierError::OutOfMemory => Code::OutOfMemory,
            CourierError::Network(_) => Code::IoError,
            CourierError::Communication(_) => Code::IoError,
            CourierError::Device(_) => Code::DeviceError,
            CourierError::Generic { code, .. } => *code,
        }
    }
}

/// Type alias for Results using CourierError
pub type CourierResult<T> = Result<T, CourierError>;
