pub mod aws;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod parameters;
pub mod provider;
pub mod stack;
pub mod status;
pub mod tags;
pub mod template;
pub mod writer;

#[cfg(test)]
mod testing;
