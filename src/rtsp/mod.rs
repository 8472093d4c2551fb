mod codec;
mod headers;
mod request;
mod response;

pub use codec::{Codec, Incoming};
pub use headers::Headers;
pub use request::Request;
pub use response::{Response, StatusCode};
