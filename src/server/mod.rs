//! Newline-delimited JSON command surface.
//!
//! Each stdin line is a [`Request`]; each response is written to stdout as
//! one [`Response`] line carrying the request's id.

mod handler;
mod protocol;

pub use handler::{COMMANDS, execute, run};
pub use protocol::{ErrorBody, Request, Response};
