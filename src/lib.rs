pub mod cli;
pub mod config;
pub mod driver;
pub mod history;
pub mod invoker;
pub mod lock;
pub mod memory;
pub mod prompt;
pub mod retry;
pub mod version;

mod app;
mod entrypoint;

pub use entrypoint::cli_entrypoint;
#[cfg(test)]
pub(crate) use entrypoint::cli_entrypoint_from;

#[cfg(test)]
mod test_support;
