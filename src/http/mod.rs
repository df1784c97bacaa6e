pub mod cookie;
pub mod request;
pub mod response;
pub mod session;

pub use request::{BodyMode, HeaderMap, HeaderName, Method, Request};
pub use response::{Response, ResponseKind, ResponseTick};
