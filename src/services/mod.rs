//! Archival pipelines and the collaborators they run against.

pub mod archiver;
pub mod auditor;
pub mod block_uploader;
pub mod checksum;
pub mod index_builder;
pub mod ledger;
pub mod local_store;
pub mod object_store;
pub mod retry;
pub mod search;
pub mod state_uploader;
