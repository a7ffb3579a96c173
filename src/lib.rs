pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod observability;

pub use db::Store;
pub use error::StoreError;
