// Data models for outgoing calls and buffered responses

pub mod request;
pub mod response;

pub use request::{bearer_from_headers, bearer_header, PendingRequest, RequestDescriptor};
pub use response::ApiResponse;
