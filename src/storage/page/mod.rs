mod bucket_page;
mod codec;
mod directory_page;

pub use bucket_page::{bucket_capacity, HashTableBucketPage};
pub use codec::FixedCodec;
pub use directory_page::{HashTableDirectoryPage, DIRECTORY_ARRAY_SIZE, DIRECTORY_MAX_DEPTH};
