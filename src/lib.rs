pub mod archive;
pub mod checksum;
pub mod config;
pub mod connectors;
pub mod db;
pub mod importer;
pub mod indexer;
pub mod mail;
pub mod output;
pub mod search;
pub mod sync;
