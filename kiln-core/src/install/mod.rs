// kiln-core/src/install/mod.rs
// Keg-level install helpers: archive extraction, compiler lookup and linking.

pub mod devtools;
pub mod extract;
pub mod link;

pub use link::{link_keg, uninstall_keg, unlink_keg};
