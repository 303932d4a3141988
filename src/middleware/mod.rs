pub mod context;
pub mod logging;
pub mod response_buffer;

pub use context::RequestContext;
pub use logging::{logging_middleware, AccessLogger};
pub use response_buffer::{response_buffer_middleware, ResponseBufferConfig, ResponseLength};
