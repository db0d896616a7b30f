mod condition;
mod config;
mod constants;
mod deploy_item;
mod errors;
mod provider;

pub use condition::*;
pub use config::*;
pub use constants::*;
pub use deploy_item::*;
pub use errors::*;
pub use provider::*;
