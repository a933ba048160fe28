pub mod channel;
pub mod commands;
pub mod json_rpc;
