pub mod cli;
pub mod config;
pub mod formatter;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod storage;
pub mod supervisor;
