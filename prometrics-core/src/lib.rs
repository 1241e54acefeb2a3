//! Request/response seam for prometrics
//!
//! The instrumentation layer does not own a web framework. It needs a request
//! (method, matched route, declared size), a response (status, body size) and a
//! way to call the next handler. This crate defines exactly that, plus the
//! shared error type and a `tracing` initializer.

pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;

pub use error::*;
pub use http::*;
pub use middleware::*;
