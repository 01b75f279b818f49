pub mod context;
pub mod disk;
pub mod job;
pub mod metadata;
pub mod mount;
pub mod repository;
pub mod vm;
