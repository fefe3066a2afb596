pub mod hashing;

pub use hashing::sha256_hex;
