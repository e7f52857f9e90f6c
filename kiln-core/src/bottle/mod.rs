// kiln-core/src/bottle/mod.rs
// Precompiled kegs: cache keys, the verified on-disk cache, packing and
// pouring.

pub mod cache;
pub mod key;
pub mod pack;
pub mod platform;

pub use cache::{BottleCache, CacheEntry};
pub use key::BottleKey;
pub use pack::{pack_keg, pour};
pub use platform::current_platform;
