pub mod args;

pub use args::{Cli, CliCommand};
