mod client;
mod error;
mod pagination;
mod request;

pub use client::ApiClient;
pub use error::{ApiError, ApiResult};
pub use pagination::{unwrap_results, Paginated};
pub use request::{ApiRequest, ApiResponse};
