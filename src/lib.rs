pub mod config;
pub mod console;
pub mod error;
pub mod launch;
pub mod lock;

pub mod ota;
