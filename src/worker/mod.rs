//! Worker module for process spawning and output parsing.

mod events;
mod parser;
mod process;

pub use events::*;
pub use parser::*;
pub use process::*;
