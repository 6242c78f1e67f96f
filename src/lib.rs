pub mod config;
pub mod container;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transfer;

pub use error::{Result, TransferError};
