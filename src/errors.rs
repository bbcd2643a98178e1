use color_eyre::Result;
use thiserror::Error;

/// Failure taxonomy for everything that can go wrong during a shift.
///
/// `Validation` is user-correctable and never mutates state. `Storage` and
/// `RemoteSync` abort the current operation but must leave local state
/// retryable. `Permission` covers denied device capabilities (for the CLI,
/// a missing position where one is required).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShiftError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("local storage failed: {0}")]
    Storage(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("remote sync failed: {0}")]
    RemoteSync(String),
}

impl ShiftError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage(reason.into())
    }

    /// True when retrying the same operation with the same input can
    /// plausibly succeed (transient storage or network trouble).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::RemoteSync(_))
    }
}

impl From<diesel::result::Error> for ShiftError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub fn init() -> Result<()> {
    let hook_builder = color_eyre::config::HookBuilder::default();
    let (panic_hook, eyre_hook) = hook_builder.into_hooks();

    let panic_hook = panic_hook.into_panic_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("{}", panic_info);
        panic_hook(panic_info);
    }));

    eyre_hook.install()?;
    Ok(())
}
