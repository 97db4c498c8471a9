pub mod archive_builder;
pub mod artifact;
pub mod bundle_cache;
pub mod catalog;
pub mod depot_service;
pub mod skin_archiver;
