mod config_cmd;
mod meal;
mod sync_cmd;
mod weight;

pub use config_cmd::ConfigCommand;
pub use meal::LogCommand;
pub use sync_cmd::SyncCommand;
pub use weight::WeightCommand;
