pub mod config;
pub mod models;
pub mod startup;
pub mod utils;
pub mod web;

#[cfg(test)]
mod test_utils;

pub use utils::{cert_manager, state};
