#![forbid(unsafe_code)]

use thiserror::Error;

/// Error enumerates the start-up errors returned by this application.
#[derive(Error, Debug)]
pub enum Errors {
    /// Input parameter logging.
    #[error("busya_server input parameters:\n{}", .0)]
    InputParms(String),

    /// Inaccessible logger configuration file.
    #[error("Unable to access the Log4rs configuration file: {}", .0)]
    Log4rsInitialization(String),

    #[error("Reading application configuration file: {}", .0)]
    ReadingConfigFile(String),

    #[error("Unable to parse TOML file: {}", .0)]
    TOMLParseError(String),

    #[error("Invalid data directory: {}", .0)]
    DataDirectory(String),

    #[error("Busya Error: {}", .0)]
    BusyaError(String),
}

/// ChatError is the failure taxonomy of the chat endpoint.  The display text
/// of each variant is exactly what the caller sees; provider diagnostics are
/// logged before a provider failure is reduced to one of these.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatError {
    #[error("Пустое сообщение")]
    Validation,

    #[error("⚠️ API ключ не настроен. Добавь его в .env!")]
    Configuration,

    #[error("⚠️ Лимит OpenAI превышен. Попробуй позже или проверь свой план.")]
    QuotaExceeded,

    #[error("Ой, ошибочка! Попробуй чуть позже ^_^")]
    TransientProvider,
}

impl ChatError {
    /// The http status code reported for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ChatError::Validation => 400,
            _ => 500,
        }
    }
}
