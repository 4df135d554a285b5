// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// protocol errors, always fatal to the read loop
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("payload of {size} bytes exceeds max packet size {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// connection errors
    #[error("connection {0} is closed")]
    ConnectionClosed(u32),

    #[error("send buffered message on connection {0} timed out")]
    SendTimeout(u32),

    #[error("connection {0} not found")]
    NotFound(u32),

    #[error("property {0} not found")]
    PropertyNotFound(String),

    /// general errors
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("reconnect failed after {0} attempts")]
    ReconnectLimitExceeded(u32),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Whether the error leaves the affected connection unusable.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            AppError::MalformedHeader(_)
                | AppError::PayloadTooLarge { .. }
                | AppError::IoError(_)
                | AppError::ConnectionClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::MalformedHeader("bad".into()).is_fatal_to_connection());
        assert!(AppError::IoError(std::io::ErrorKind::BrokenPipe.into()).is_fatal_to_connection());
        assert!(!AppError::SendTimeout(1).is_fatal_to_connection());
        assert!(!AppError::PropertyNotFound("k".into()).is_fatal_to_connection());
    }

    #[test]
    fn test_display() {
        let err = AppError::PayloadTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "payload of 10 bytes exceeds max packet size 4");
        assert_eq!(AppError::NotFound(7).to_string(), "connection 7 not found");
    }
}
