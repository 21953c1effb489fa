pub mod api_key_store;
pub mod authenticator;
pub mod token_manager;

pub use api_key_store::ApiKeyStore;
pub use authenticator::Authenticator;
pub use token_manager::{RefreshTokenManager, RefreshTokenRecord, StoredRefreshToken};
