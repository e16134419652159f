pub mod bot;
pub mod capture;
pub mod config;
pub mod extract;
pub mod health;
pub mod pidfile;
pub mod positions;
pub mod process;
pub mod recovery;
pub mod supervisor;
mod util;

pub use supervisor::{CoordinatedTask, Supervisor};
