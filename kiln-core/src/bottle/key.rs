// kiln-core/src/bottle/key.rs
use std::fmt;
use std::path::Path;

use kiln_common::dependency::BuildNode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Everything a precompiled artifact depends on. Two nodes share a bottle
/// only when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BottleKey {
    pub name: String,
    /// Version including revision.
    pub version: String,
    pub platform: String,
    /// Canonical option string of the node.
    pub options: String,
    /// Node identity (covers the compiler environment too).
    pub identity: String,
    /// Keg prefix the artifact was built for; binaries may embed it.
    pub prefix: String,
}

impl BottleKey {
    pub fn for_node(node: &BuildNode, platform: &str, keg: &Path) -> Self {
        Self {
            name: node.formula.name.clone(),
            version: node.formula.version_str_full(),
            platform: platform.to_string(),
            options: node.options.canonical(),
            identity: node.identity.clone(),
            prefix: keg.display().to_string(),
        }
    }

    /// Hex SHA-256 the cache entry is filed under.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.name,
            &self.version,
            &self.platform,
            &self.options,
            &self.identity,
            &self.prefix,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for BottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BottleKey {
        BottleKey {
            name: "zlib".into(),
            version: "1.3".into(),
            platform: "x86_64_linux".into(),
            options: String::new(),
            identity: "ab".repeat(32),
            prefix: "/k/Cellar/zlib/1.3".into(),
        }
    }

    #[test]
    fn every_field_feeds_the_digest() {
        let base = key().digest();
        assert_eq!(base.len(), 64);
        assert_eq!(base, key().digest());

        let mut other_prefix = key();
        other_prefix.prefix = "/other/Cellar/zlib/1.3".into();
        let mut other_platform = key();
        other_platform.platform = "arm64_macos".into();
        let mut other_options = key();
        other_options.options = "with-debug=true".into();
        for changed in [other_prefix, other_platform, other_options] {
            assert_ne!(changed.digest(), base);
        }
    }
}
