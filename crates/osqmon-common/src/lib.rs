pub mod duration;
pub mod error;

pub use duration::parse_duration;
pub use error::{OsqmonError, Result};
