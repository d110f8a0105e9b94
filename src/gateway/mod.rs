//! Provider gateway for the remote classifier endpoint.

pub mod deepseek;
pub mod error;
pub mod types;

pub use deepseek::{ChatProvider, DeepSeekAdapter};
pub use error::{ErrorContext, FailureKind, ProviderError};
pub use types::*;
