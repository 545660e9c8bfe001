pub mod config;
pub mod error;
pub mod generation;
pub mod pipeline;
pub mod report;
pub mod shutdown;
pub mod tools;

#[cfg(test)]
mod testing;
