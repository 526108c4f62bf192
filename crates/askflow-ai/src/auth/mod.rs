//! Bearer credential acquisition and caching for the token-based backend

mod cache;
mod source;

pub use cache::{AuthToken, AuthTokenCache};
pub use source::SessionTokenSource;

use async_trait::async_trait;

use crate::error::Result;

/// Performs one acquisition round trip against the token backend.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<String>;
}
