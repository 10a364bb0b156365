pub mod cli;
pub mod commands;
pub mod constants;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;
pub mod worker;

pub use error::{AppError, Error, Result};
