//! Option resolution against a recipe modelled on a versioned boost formula.

use kiln_common::model::{resolve_options, Formula, OptionValue};

const BOOST: &str = r#"{
    "name": "boost@1.62",
    "version": "1.62.0",
    "options": [
        {"name": "with-icu4c", "description": "Build regexp engine with icu support"},
        {"name": "without-single", "description": "Disable building single-threading variant"},
        {"name": "without-static", "description": "Disable building static library variant"},
        {"name": "c++11", "description": "Build using C++11 mode"},
        {"name": "layout", "description": "Library naming layout", "default": "tagged"}
    ],
    "deprecated_options": [
        {"old": "with-icu", "new": "with-icu4c"},
        {"old": "with-unicode", "new": "with-icu"},
        {"old": "cxx11", "new": "c++11"}
    ],
    "dependencies": [{"name": "icu4c", "kind": "optional", "options": ["c++11"]}]
}"#;

fn boost() -> Formula {
    Formula::load(BOOST, "boost@1.62.json").unwrap()
}

#[test]
fn deprecated_names_resolve_like_their_replacements() {
    let f = boost();
    let pairs = [
        ("--with-icu", "--with-icu4c"),
        ("--with-unicode", "--with-icu4c"),
        ("cxx11", "c++11"),
    ];
    for (old, new) in pairs {
        let via_old = resolve_options(&f, &[old]);
        let via_new = resolve_options(&f, &[new]);
        assert_eq!(via_old.options, via_new.options, "{old} vs {new}");
        assert!(via_old.warnings.is_empty());
    }
}

#[test]
fn defaults_then_user_overrides() {
    let f = boost();
    let defaults = resolve_options(&f, &[] as &[&str]).options;
    assert_eq!(defaults, f.default_options());
    assert_eq!(defaults.get("layout"), Some(&OptionValue::Str("tagged".into())));
    assert!(defaults.with("single"));
    assert!(!defaults.with("icu4c"));

    let resolved = resolve_options(
        &f,
        &["--without-static", "--layout=system", "--with-icu4c=false"],
    );
    assert!(resolved.warnings.is_empty());
    assert!(!resolved.options.with("static"));
    assert_eq!(
        resolved.options.get("layout"),
        Some(&OptionValue::Str("system".into()))
    );
    assert!(!resolved.options.with("icu4c"));
}

#[test]
fn later_flags_win() {
    let f = boost();
    let resolved = resolve_options(&f, &["--with-icu4c", "--with-icu4c=false"]);
    assert!(!resolved.options.is_set("with-icu4c"));
}

#[test]
fn opposite_spelling_toggles_the_declared_option() {
    let f = boost();
    let resolved = resolve_options(&f, &["--with-single"]);
    assert!(resolved.warnings.is_empty());
    assert_eq!(
        resolved.options.get("without-single"),
        Some(&OptionValue::Bool(false))
    );
    let off = resolve_options(&f, &["--without-icu4c"]);
    assert!(!off.options.with("icu4c"));
}

#[test]
fn unknown_flags_warn_without_failing() {
    let f = boost();
    let resolved = resolve_options(&f, &["--with-python", "--c++11", "--layout"]);
    assert!(resolved.options.is_set("c++11"));
    let flags: Vec<&str> = resolved.warnings.iter().map(|w| w.flag.as_str()).collect();
    assert_eq!(flags, vec!["--with-python", "--layout"]);
    assert!(resolved.warnings[0].to_string().contains("boost@1.62"));
}

#[test]
fn active_flags_reproduce_the_set() {
    let f = boost();
    let resolved = resolve_options(&f, &["--with-icu", "--layout=system"]).options;
    let flags = resolved.active_flags(&f);
    assert_eq!(flags, vec!["--layout=system", "--with-icu4c"]);
    assert_eq!(resolve_options(&f, &flags).options, resolved);
}
