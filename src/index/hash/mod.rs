pub mod error;
pub mod table;

pub use error::HashIndexError;
pub use table::ExtendibleHashTable;
