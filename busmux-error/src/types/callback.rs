use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Сбой пользовательского callback'а.
///
/// Перехватывается в месте вызова, логируется и отбрасывается.
#[derive(Debug, Clone, Error)]
pub enum CallbackError {
    /// Callback вернул ошибку.
    #[error("{callback} callback failed: {reason}")]
    Failed {
        callback: &'static str,
        reason: String,
    },
    /// Callback запаниковал.
    #[error("{callback} callback panicked: {reason}")]
    Panicked {
        callback: &'static str,
        reason: String,
    },
}

impl ErrorExt for CallbackError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Failed { .. } => StatusCode::CallbackFailed,
            Self::Panicked { .. } => StatusCode::CallbackPanicked,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let callback = match self {
            Self::Failed { callback, .. } | Self::Panicked { callback, .. } => callback,
        };
        vec![
            ("error_type", "callback".to_string()),
            ("status_code", self.status_code().to_string()),
            ("callback", callback.to_string()),
        ]
    }
}
