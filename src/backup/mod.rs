pub mod archive;
pub mod backup_config;
pub mod compress;
pub mod engine;
pub mod file_ext;
pub mod finish;
pub mod lock;
pub mod orchestrator;
pub mod report;
pub mod result_error;
pub mod retention;
pub mod schedule;
pub mod source;
pub mod validate;
