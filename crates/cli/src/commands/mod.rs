pub mod audit;
pub mod check;
pub mod config_cmd;
pub mod secret;
pub mod serve;
