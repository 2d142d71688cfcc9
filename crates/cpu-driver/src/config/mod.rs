pub mod cli;
pub mod driver;

pub use cli::*;
pub use driver::*;
