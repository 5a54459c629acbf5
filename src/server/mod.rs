//! HTTP surface: uploads, process requests and task polling.

pub mod http;
pub mod types;

pub use http::{error_response, HttpServer, USER_HEADER};
