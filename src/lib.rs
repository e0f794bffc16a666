pub mod callbacks;
pub mod config;
pub mod controller;
pub mod filter;
pub mod machine;
pub mod pid;
pub mod profile;
pub mod state;
pub mod types;

pub use controller::*;
pub use types::*;
