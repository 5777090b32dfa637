pub mod blob;
pub mod db;
pub mod leases;
pub mod orders;
pub mod sessions;
pub mod stats;
pub mod users;

pub use blob::{BlobStore, BlobStream, ObjectBlobStore};
pub use db::Database;
