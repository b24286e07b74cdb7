pub mod error;
pub mod parse;
pub mod registry;
pub mod server;

pub use error::{Result, ServerError};
pub use registry::ServerRegistry;
pub use server::{JobHandle, Server};
