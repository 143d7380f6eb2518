//! HTTP primitives
//!
//! Wire framing, header and body representations, and the origin client
//! shared by the proxy and the intruder.

pub mod body;
mod client;
mod headers;
mod request;
mod response;
pub mod wire;

pub use body::Body;
pub use client::{crypto_provider, BoxedIo, HttpClient, Io};
pub use headers::Headers;
pub use request::{authority, origin_form, HttpRequest};
pub use response::HttpResponse;
