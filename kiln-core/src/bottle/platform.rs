// kiln-core/src/bottle/platform.rs
use std::env;

/// Platform tag used to select declared bottles and key cached ones,
/// e.g. `x86_64_linux` or `arm64_macos`.
pub fn current_platform() -> String {
    let arch = match env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}_{}", arch, env::consts::OS)
}

/// Tags a declared bottle may be filed under for this platform, most
/// specific first. `all` marks architecture-independent bottles.
pub fn platform_candidates() -> Vec<String> {
    vec![current_platform(), "all".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_arch_and_os() {
        let tag = current_platform();
        assert!(tag.ends_with(env::consts::OS));
        assert!(!tag.starts_with("aarch64"));
        assert_eq!(platform_candidates().last().map(String::as_str), Some("all"));
    }
}
