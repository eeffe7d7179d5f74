//! Text-based dylib stubs.
//!
//! A `.tbd` file stands in for a dylib at link time: a YAML document (or
//! a stack of them, one per re-exported library) listing the library's
//! install name and exported symbols per target. Exports can also carry
//! `$ld$` directive symbols that patch the library's identity depending
//! on the deployment target.

use crate::error::{Error, Result};
use crate::opt::{parse_version, LinkOptions};
use std::collections::{BTreeSet, HashMap, HashSet};

pub mod yaml;

use yaml::{parse_yaml, YamlNode};

#[derive(Debug, Default, Clone)]
pub struct TextDylib {
    pub install_name: String,
    pub reexported_libs: Vec<String>,
    pub exports: BTreeSet<String>,
    pub weak_exports: BTreeSet<String>,
}

fn get_list<'a>(node: &'a YamlNode, key: &str) -> &'a [YamlNode] {
    node.get(key).and_then(|n| n.as_list()).unwrap_or(&[])
}

fn get_strings(node: &YamlNode, key: &str) -> Vec<String> {
    get_list(node, key)
        .iter()
        .filter_map(|n| n.as_str().map(str::to_string))
        .collect()
}

fn matches_arch(targets: &[YamlNode], arch: &str) -> bool {
    targets.iter().filter_map(|t| t.as_str()).any(|t| {
        t == arch || t.strip_prefix(arch).map_or(false, |rest| rest.starts_with('-'))
    })
}

fn to_tbd(node: &YamlNode, arch: &str, filename: &str, opts: &LinkOptions) -> Option<TextDylib> {
    if !matches_arch(get_list(node, "targets"), arch) {
        return None;
    }

    if opts.application_extension
        && get_list(node, "flags")
            .iter()
            .any(|f| f.as_str() == Some("not_app_extension_safe"))
    {
        log::warn!(
            "linking against a dylib which is not safe for use in application extensions: {}",
            filename
        );
    }

    let mut tbd = TextDylib::default();
    if let Some(name) = node.get("install-name").and_then(|n| n.as_str()) {
        tbd.install_name = name.to_string();
    }

    for member in get_list(node, "reexported-libraries") {
        if matches_arch(get_list(member, "targets"), arch) {
            tbd.reexported_libs.extend(get_strings(member, "libraries"));
        }
    }

    for key in ["exports", "reexports"] {
        for member in get_list(node, key) {
            if !matches_arch(get_list(member, "targets"), arch) {
                continue;
            }
            tbd.exports.extend(get_strings(member, "symbols"));
            tbd.weak_exports.extend(get_strings(member, "weak-symbols"));
            for class in get_strings(member, "objc-classes") {
                tbd.exports.insert(format!("_OBJC_CLASS_$_{}", class));
                tbd.exports.insert(format!("_OBJC_METACLASS_$_{}", class));
            }
            for name in get_strings(member, "objc-eh-types") {
                tbd.exports.insert(format!("_OBJC_EHTYPE_$_{}", name));
            }
            for ivar in get_strings(member, "objc-ivars") {
                tbd.exports.insert(format!("_OBJC_IVAR_$_{}", ivar));
            }
        }
    }

    Some(tbd)
}

/// Directive symbols start with `$ld$` and patch the dylib's identity
/// and export set for the configured deployment target rather than
/// naming anything.
fn interpret_ld_symbols(tbd: &mut TextDylib, opts: &LinkOptions) {
    let mut added: BTreeSet<String> = BTreeSet::new();
    let mut hidden: HashSet<String> = HashSet::new();
    let mut install_name: Option<String> = None;

    for s in &tbd.exports {
        if !s.starts_with("$ld$") {
            continue;
        }

        // $ld$previous$<install>$<compat>$<platform>$<min>$<max>$<symbol>$
        // replaces the install name when the deployment target falls in
        // [min, max).
        if s.starts_with("$ld$previous$") {
            let fields: Vec<&str> = s.split('$').collect();
            if fields.len() != 10 || !fields[9].is_empty() {
                continue;
            }
            // a per-symbol install name never worked in ld64 either;
            // only the whole-library form is honored
            if !fields[8].is_empty() {
                continue;
            }
            let (platform, min, max) = match (
                fields[5].parse::<u32>(),
                parse_version(fields[6]),
                parse_version(fields[7]),
            ) {
                (Ok(platform), Ok(min), Ok(max)) => (platform, min, max),
                _ => continue,
            };
            if platform == opts.platform
                && min <= opts.platform_min_version
                && opts.platform_min_version < max
            {
                install_name = Some(fields[3].to_string());
            }
            continue;
        }

        // $ld$add$os<version>$<symbol> exports an extra symbol for one
        // exact deployment target; $ld$hide$... removes one.
        if let Some(rest) = s.strip_prefix("$ld$add$os") {
            if let Some((ver, sym)) = rest.split_once('$') {
                if parse_version(ver).ok() == Some(opts.platform_min_version) {
                    added.insert(sym.to_string());
                }
            }
            continue;
        }
        if let Some(rest) = s.strip_prefix("$ld$hide$os") {
            if let Some((ver, sym)) = rest.split_once('$') {
                if parse_version(ver).ok() == Some(opts.platform_min_version) {
                    hidden.insert(sym.to_string());
                }
            }
            continue;
        }
        if let Some(rest) = s.strip_prefix("$ld$install_name$os") {
            if let Some((ver, name)) = rest.split_once('$') {
                if parse_version(ver).ok() == Some(opts.platform_min_version) {
                    install_name = Some(name.to_string());
                }
            }
            continue;
        }
    }

    let mut exports = added;
    for s in &tbd.exports {
        if !s.starts_with("$ld$") && !hidden.contains(s.as_str()) {
            exports.insert(s.clone());
        }
    }
    tbd.exports = exports;
    if let Some(name) = install_name {
        tbd.install_name = name;
    }
}

/// A document stack describes the main dylib followed by its re-exported
/// libraries; fold the children's exports into the parent.
fn squash(mut tbds: Vec<TextDylib>) -> TextDylib {
    let mut main = tbds.remove(0);
    let mut by_name: HashMap<String, TextDylib> = tbds
        .into_iter()
        .map(|t| (t.install_name.clone(), t))
        .collect();

    let mut remaining = Vec::new();
    let mut queue: Vec<String> = std::mem::take(&mut main.reexported_libs);
    while let Some(lib) = queue.pop() {
        match by_name.remove(&lib) {
            Some(child) => {
                main.exports.extend(child.exports);
                main.weak_exports.extend(child.weak_exports);
                queue.extend(child.reexported_libs);
            }
            None => remaining.push(lib),
        }
    }
    remaining.reverse();
    main.reexported_libs = remaining;
    main
}

/// Parses a `.tbd` file for one architecture.
pub fn parse_tbd(
    contents: &str,
    filename: &str,
    arch: &str,
    opts: &LinkOptions,
) -> Result<TextDylib> {
    let docs = parse_yaml(contents).map_err(|err| {
        let line = contents[..err.pos.min(contents.len())]
            .bytes()
            .filter(|&b| b == b'\n')
            .count();
        Error::Malformed(format!(
            "{}:{}: YAML parse error: {}",
            filename,
            line + 1,
            err.msg
        ))
    })?;

    let mut tbds: Vec<TextDylib> = docs
        .iter()
        .filter_map(|doc| to_tbd(doc, arch, filename, opts))
        .collect();
    if tbds.is_empty() {
        return Err(Error::Malformed(format!(
            "{}: malformed TBD file (no document matches {})",
            filename, arch
        )));
    }
    for tbd in &mut tbds {
        interpret_ld_symbols(tbd, opts);
    }
    Ok(squash(tbds))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBSYSTEM: &str = "\
--- !tapi-tbd
tbd-version: 4
targets: [ x86_64-macos, arm64-macos ]
install-name: '/usr/lib/libSystem.B.dylib'
reexported-libraries:
  - targets: [ x86_64-macos, arm64-macos ]
    libraries: [ '/usr/lib/system/libsystem_c.dylib' ]
exports:
  - targets: [ arm64-macos ]
    symbols: [ _printf, dyld_stub_binder ]
  - targets: [ x86_64-macos ]
    symbols: [ _printf_x86 ]
--- !tapi-tbd
tbd-version: 4
targets: [ x86_64-macos, arm64-macos ]
install-name: '/usr/lib/system/libsystem_c.dylib'
exports:
  - targets: [ arm64-macos, x86_64-macos ]
    symbols: [ _malloc ]
    weak-symbols: [ _weakling ]
...
";

    #[test]
    fn squashes_reexports() {
        let opts = LinkOptions::default();
        let tbd = parse_tbd(LIBSYSTEM, "libSystem.tbd", "arm64", &opts).unwrap();
        assert_eq!(tbd.install_name, "/usr/lib/libSystem.B.dylib");
        assert!(tbd.exports.contains("_printf"));
        assert!(tbd.exports.contains("_malloc"));
        assert!(tbd.weak_exports.contains("_weakling"));
        assert!(!tbd.exports.contains("_printf_x86"));
        assert!(tbd.reexported_libs.is_empty());
    }

    #[test]
    fn arch_filtering() {
        let opts = LinkOptions::default();
        let tbd = parse_tbd(LIBSYSTEM, "libSystem.tbd", "x86_64", &opts).unwrap();
        assert!(tbd.exports.contains("_printf_x86"));
        assert!(!tbd.exports.contains("_printf"));
    }

    #[test]
    fn ld_directives() {
        let mut opts = LinkOptions::default();
        opts.platform_min_version = parse_version("10.15").unwrap();
        let src = "\
--- !tapi-tbd
targets: [ arm64-macos ]
install-name: '/usr/lib/libfoo.dylib'
exports:
  - targets: [ arm64-macos ]
    symbols: [ _real, '$ld$add$os10.15$_added', '$ld$hide$os10.15$_real',
               '$ld$install_name$os10.15$/usr/lib/libbar.dylib' ]
...
";
        let tbd = parse_tbd(src, "libfoo.tbd", "arm64", &opts).unwrap();
        assert!(tbd.exports.contains("_added"));
        assert!(!tbd.exports.contains("_real"));
        assert_eq!(tbd.install_name, "/usr/lib/libbar.dylib");

        // a different deployment target leaves everything alone
        opts.platform_min_version = parse_version("11.0").unwrap();
        let tbd = parse_tbd(src, "libfoo.tbd", "arm64", &opts).unwrap();
        assert!(tbd.exports.contains("_real"));
        assert!(!tbd.exports.contains("_added"));
        assert_eq!(tbd.install_name, "/usr/lib/libfoo.dylib");
    }
}
