use serde::Serialize;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_ctx(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let item = format!("{}={}", key.into(), value.into());
        self.detail = Some(match self.detail.take() {
            Some(existing) => format!("{existing}; {item}"),
            None => item,
        });
        self
    }

    pub fn from_anyhow(error: anyhow::Error) -> Self {
        if let Some(app_error) = error.downcast_ref::<Self>() {
            return app_error.clone();
        }

        let chain = error
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        AppError::new("INTERNAL_ERROR", "operation failed").with_detail(chain)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for AppError {}

pub type AppResult<T> = Result<T, AppError>;

pub trait ResultExt<T> {
    fn with_code(self, code: impl Into<String>, message: impl Into<String>) -> AppResult<T>;
    fn with_ctx(self, key: impl Into<String>, value: impl Into<String>) -> AppResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_code(self, code: impl Into<String>, message: impl Into<String>) -> AppResult<T> {
        let code = code.into();
        let message = message.into();
        self.map_err(|error| {
            let source: anyhow::Error = error.into();
            AppError::new(code, message).with_detail(
                source
                    .chain()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(": "),
            )
        })
    }

    fn with_ctx(self, key: impl Into<String>, value: impl Into<String>) -> AppResult<T> {
        let key = key.into();
        let value = value.into();
        self.map_err(|error| AppError::from_anyhow(error.into()).with_ctx(key, value))
    }
}
