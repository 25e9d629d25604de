//! A schema migration engine. Migration scripts live in a directory as
//! `<version>_<name>.<up|down>.sql` pairs; a [`driver::Driver`] per
//! database technology applies them and keeps a bookkeeping table, and the
//! [`engine::Engine`] decides what to run, streaming each script's progress
//! and errors through a [`pipe`].

pub mod config;
pub mod driver;
pub mod engine;
pub mod exit_code;
pub mod migration_files;
pub mod migrations;
pub mod pipe;
pub mod statements;
