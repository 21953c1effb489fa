pub mod mw_traits;
pub mod request_id;

pub use mw_traits::{ApiKeyVerifier, TokenVerifier};
pub use request_id::{REQUEST_ID_HEADER, request_id_middleware};
