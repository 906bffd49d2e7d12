//! Load-balanced forwarding to backend endpoints.

pub mod balancer;
pub mod forwarder;

pub use balancer::{Endpoint, EndpointPool};
pub use forwarder::{Forwarder, RetryPolicy};
