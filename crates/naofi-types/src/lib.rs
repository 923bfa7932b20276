//! Status codes and the `Status`/`Result` error types shared by the naofi
//! crates.

#[allow(non_snake_case)]
pub mod status_code;

pub mod result;
pub mod status;

pub use result::{make_error, make_error_msg, Result};
pub use status::Status;
pub use status_code::*;
