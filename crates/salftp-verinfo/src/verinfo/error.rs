use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerInfoError {
    #[error("script is empty")]
    Empty,
    #[error("script does not start with SALAMANDER_VERINFO_BEGIN")]
    MissingBegin,
    #[error("script does not end with SALAMANDER_VERINFO_EOF")]
    MissingEof,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("script file is too large ({0} bytes)")]
    TooLarge(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VerInfoResult<T> = Result<T, VerInfoError>;

impl VerInfoError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }
}
