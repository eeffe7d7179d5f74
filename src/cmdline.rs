//! The ld64-style command line: single-dash long options, joined
//! options like `-lfoo`, `@response-file` expansion and the library /
//! framework search rules.

use crate::error::{Error, Result};
use crate::mach::constants::cputype;
use crate::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use crate::opt::{parse_platform, parse_version, LinkOptions};
use std::fs;
use std::path::Path;

pub const HELP: &str = "\
Options:
  -F<PATH>                    Add DIR to framework search path
  -L<PATH>                    Add DIR to library search path
  -Z                          Do not search the standard directories when
                              searching for libraries and frameworks
  -ObjC                       Load all static archive members that implement
                              an Objective-C class or category
  -adhoc_codesign             Add ad-hoc code signature to the output file
    -no_adhoc_codesign
  -add_ast_path <FILE>        Add a N_AST entry pointing at a Swift AST file
  -arch <ARCH_NAME>           Specify target architecture
  -bundle                     Produce a mach-o bundle
  -dead_strip                 Remove unreachable functions and data
  -dead_strip_dylibs          Remove unreachable dylibs from dependencies
  -dylib                      Produce a dynamic library
  -e <SYMBOL>                 Specify the entry point of a main executable
  -execute                    Produce an executable (default)
  -filelist <FILE>            Specify the list of input file names
  -framework <NAME>[,<SUFFIX>]
                              Search for a given framework
  -headerpad <SIZE>           Allocate the size of padding after load commands
  -headerpad_max_install_names
                              Allocate MAXPATHLEN byte padding after load commands
  -help                       Report usage information
  -l<LIB>                     Search for a given library
  -lto_library <FILE>         Load a given libLTO for bitcode inputs
  -map <FILE>                 Write map file to a given file
  -needed-l<LIB>              Search for a given library, keep its load command
  -needed_framework <NAME>[,<SUFFIX>]
                              Search for a given framework, keep its load command
  -o <FILE>                   Set output filename
  -pagezero_size <SIZE>       Specify the size of the __PAGEZERO segment
  -platform_version <PLATFORM> <MIN_VERSION> <SDK_VERSION>
                              Set platform, platform version and SDK version
  -rpath <PATH>               Add PATH to the runpath search path list
  -syslibroot <DIR>           Prepend DIR to library search paths
  -t                          Print out each file the linker loads
  -v                          Report version information";

#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    File(String),
    Lib { name: String, needed: bool },
    Framework { name: String, needed: bool },
}

#[derive(Debug)]
pub struct ParsedArgs {
    pub opts: LinkOptions,
    pub output_type: u32,
    pub inputs: Vec<InputSpec>,
    pub print_help: bool,
    pub print_version: bool,
}

struct Cursor<'a> {
    args: &'a [String],
    i: usize,
}

impl<'a> Cursor<'a> {
    fn flag(&mut self, name: &str) -> bool {
        if self.args[self.i] == name {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn arg(&mut self, name: &str) -> Result<Option<&'a str>> {
        if self.args[self.i] != name {
            return Ok(None);
        }
        if self.i + 1 >= self.args.len() {
            return Err(Error::Malformed(format!("option {}: argument missing", name)));
        }
        self.i += 2;
        Ok(Some(&self.args[self.i - 1]))
    }

    fn arg3(&mut self, name: &str) -> Result<Option<(&'a str, &'a str, &'a str)>> {
        if self.args[self.i] != name {
            return Ok(None);
        }
        if self.i + 3 >= self.args.len() {
            return Err(Error::Malformed(format!("option {}: argument missing", name)));
        }
        self.i += 4;
        Ok(Some((
            &self.args[self.i - 3],
            &self.args[self.i - 2],
            &self.args[self.i - 1],
        )))
    }

    /// `-lfoo` or `-l foo`.
    fn joined(&mut self, name: &str) -> Result<Option<&'a str>> {
        if let Some(arg) = self.arg(name)? {
            return Ok(Some(arg));
        }
        if let Some(rest) = self.args[self.i].strip_prefix(name) {
            self.i += 1;
            return Ok(Some(rest));
        }
        Ok(None)
    }
}

fn parse_hex(name: &str, arg: &str) -> Result<u64> {
    let digits = arg.strip_prefix("0x").unwrap_or(arg);
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::Malformed(format!("malformed {}: {}", name, arg)))
}

pub fn parse_args(args: &[String]) -> Result<ParsedArgs> {
    let mut opts = LinkOptions::default();
    let mut output_type = MH_EXECUTE;
    let mut inputs = Vec::new();
    let mut print_help = false;
    let mut print_version = false;
    let mut nostdlib = false;
    let mut library_paths: Vec<String> = Vec::new();
    let mut framework_paths: Vec<String> = Vec::new();
    let mut pagezero_size: Option<u64> = None;
    let mut adhoc_codesign: Option<bool> = None;

    let mut cur = Cursor { args, i: 0 };
    while cur.i < args.len() {
        if cur.flag("-help") || cur.flag("--help") {
            print_help = true;
        } else if let Some(arg) = cur.joined("-F")? {
            framework_paths.push(arg.to_string());
        } else if let Some(arg) = cur.joined("-L")? {
            library_paths.push(arg.to_string());
        } else if cur.flag("-Z") {
            nostdlib = true;
        } else if cur.flag("-ObjC") {
            opts.objc = true;
        } else if cur.flag("-adhoc_codesign") {
            adhoc_codesign = Some(true);
        } else if cur.flag("-no_adhoc_codesign") {
            adhoc_codesign = Some(false);
        } else if let Some(arg) = cur.arg("-add_ast_path")? {
            opts.add_ast_path.push(arg.to_string());
        } else if let Some(arg) = cur.arg("-arch")? {
            opts.arch = match arg {
                "x86_64" => cputype::CPU_TYPE_X86_64,
                "arm64" => cputype::CPU_TYPE_ARM64,
                _ => return Err(Error::Malformed(format!("unknown -arch: {}", arg))),
            };
        } else if cur.flag("-bundle") {
            output_type = MH_BUNDLE;
        } else if cur.flag("-color-diagnostics") || cur.flag("--color-diagnostics") {
        } else if cur.flag("-dead_strip") {
            opts.dead_strip = true;
        } else if cur.flag("-dead_strip_dylibs") {
            opts.dead_strip_dylibs = true;
        } else if cur.flag("-demangle") || cur.flag("-dynamic") || cur.flag("-no_deduplicate")
            || cur.flag("-search_paths_first") || cur.flag("-fatal_warnings")
        {
            // accepted for compatibility
        } else if cur.flag("-dylib") {
            output_type = MH_DYLIB;
        } else if let Some(arg) = cur.arg("-e")? {
            opts.entry = arg.to_string();
        } else if cur.flag("-execute") {
            output_type = MH_EXECUTE;
        } else if let Some(arg) = cur.arg("-filelist")? {
            let listing = fs::read_to_string(arg)
                .map_err(|e| Error::Malformed(format!("{}: cannot open: {}", arg, e)))?;
            for line in listing.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    inputs.push(InputSpec::File(line.to_string()));
                }
            }
        } else if let Some(arg) = cur.arg("-framework")? {
            inputs.push(InputSpec::Framework {
                name: arg.split(',').next().unwrap().to_string(),
                needed: false,
            });
        } else if let Some(arg) = cur.arg("-needed_framework")? {
            inputs.push(InputSpec::Framework {
                name: arg.split(',').next().unwrap().to_string(),
                needed: true,
            });
        } else if let Some(arg) = cur.arg("-final_output")? {
            opts.final_output = arg.to_string();
        } else if let Some(arg) = cur.arg("-headerpad")? {
            opts.headerpad = parse_hex("-headerpad", arg)?;
        } else if cur.flag("-headerpad_max_install_names") {
            opts.headerpad = 1024;
        } else if let Some(arg) = cur.arg("-lto_library")? {
            opts.lto_library = arg.to_string();
        } else if let Some(arg) = cur.joined("-needed-l")? {
            inputs.push(InputSpec::Lib {
                name: arg.to_string(),
                needed: true,
            });
        } else if let Some(arg) = cur.joined("-l")? {
            inputs.push(InputSpec::Lib {
                name: arg.to_string(),
                needed: false,
            });
        } else if let Some(arg) = cur.arg("-map")? {
            opts.map = arg.to_string();
        } else if let Some(arg) = cur.arg("-o")? {
            opts.output = arg.to_string();
        } else if let Some(arg) = cur.arg("-pagezero_size")? {
            pagezero_size = Some(parse_hex("-pagezero_size", arg)?);
        } else if let Some((platform, min, sdk)) = cur.arg3("-platform_version")? {
            opts.platform = parse_platform(platform)?;
            opts.platform_min_version = parse_version(min)?;
            opts.platform_sdk_version = parse_version(sdk)?;
        } else if let Some(arg) = cur.arg("-rpath")? {
            opts.rpath.push(arg.to_string());
        } else if cur.flag("-search_dylibs_first") {
            return Err(Error::Malformed(
                "-search_dylibs_first is not supported".to_string(),
            ));
        } else if let Some(arg) = cur.arg("-syslibroot")? {
            opts.syslibroot.push(arg.to_string());
        } else if cur.flag("-t") {
            opts.trace = true;
        } else if cur.flag("-v") {
            print_version = true;
        } else {
            let arg = &args[cur.i];
            if arg.starts_with('-') {
                return Err(Error::Malformed(format!(
                    "unknown command line option: {}",
                    arg
                )));
            }
            inputs.push(InputSpec::File(arg.clone()));
            cur.i += 1;
        }
    }

    let add_search_path = |vec: &mut Vec<String>, path: String| {
        if !path.starts_with('/') || opts.syslibroot.is_empty() {
            if Path::new(&path).is_dir() {
                vec.push(path);
            }
            return;
        }
        let mut found = false;
        for root in &opts.syslibroot {
            let rerooted = format!("{}/{}", root.trim_end_matches('/'), path.trim_start_matches('/'));
            if Path::new(&rerooted).is_dir() {
                vec.push(rerooted);
                found = true;
            }
        }
        if !found && Path::new(&path).is_dir() {
            vec.push(path);
        }
    };

    let mut resolved_library_paths = Vec::new();
    for path in library_paths {
        add_search_path(&mut resolved_library_paths, path);
    }
    if !nostdlib {
        add_search_path(&mut resolved_library_paths, "/usr/lib".to_string());
        add_search_path(&mut resolved_library_paths, "/usr/local/lib".to_string());
    }

    let mut resolved_framework_paths = Vec::new();
    for path in framework_paths {
        add_search_path(&mut resolved_framework_paths, path);
    }
    if !nostdlib {
        add_search_path(&mut resolved_framework_paths, "/Library/Frameworks".to_string());
        add_search_path(
            &mut resolved_framework_paths,
            "/System/Library/Frameworks".to_string(),
        );
    }
    opts.library_paths = resolved_library_paths;
    opts.framework_paths = resolved_framework_paths;

    match pagezero_size {
        Some(size) => {
            if output_type != MH_EXECUTE {
                return Err(Error::Malformed(
                    "-pagezero_size option can only be used when linking a main executable"
                        .to_string(),
                ));
            }
            opts.pagezero_size = size;
        }
        None => {
            opts.pagezero_size = if output_type == MH_EXECUTE {
                0x1_0000_0000
            } else {
                0
            };
        }
    }

    // signing is on by default only where the loader requires it
    opts.adhoc_codesign =
        adhoc_codesign.unwrap_or(opts.arch == cputype::CPU_TYPE_ARM64);

    Ok(ParsedArgs {
        opts,
        output_type,
        inputs,
        print_help,
        print_version,
    })
}

/// Replaces every `@path` argument with the whitespace-separated,
/// possibly quoted tokens of that file, recursively.
pub fn expand_response_files(args: Vec<String>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            read_response_file(path, 1, &mut out)?;
        } else {
            out.push(arg);
        }
    }
    Ok(out)
}

fn read_response_file(path: &str, depth: usize, out: &mut Vec<String>) -> Result<()> {
    if depth > 10 {
        return Err(Error::Malformed(format!(
            "{}: response file nesting too deep",
            path
        )));
    }
    let data = fs::read(path)
        .map_err(|e| Error::Malformed(format!("{}: cannot open: {}", path, e)))?;

    let mut i = 0;
    while i < data.len() {
        if data[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let mut buf = String::new();
        if data[i] == b'\'' || data[i] == b'"' {
            let quote = data[i];
            i += 1;
            loop {
                match data.get(i) {
                    None => {
                        return Err(Error::Malformed(format!(
                            "{}: premature end of input",
                            path
                        )))
                    }
                    Some(&b) if b == quote => {
                        i += 1;
                        break;
                    }
                    Some(b'\\') if i + 1 < data.len() => {
                        buf.push(data[i + 1] as char);
                        i += 2;
                    }
                    Some(&b) => {
                        buf.push(b as char);
                        i += 1;
                    }
                }
            }
        } else {
            while i < data.len() && !data[i].is_ascii_whitespace() {
                if data[i] == b'\\' && i + 1 < data.len() {
                    buf.push(data[i + 1] as char);
                    i += 2;
                } else {
                    buf.push(data[i] as char);
                    i += 1;
                }
            }
        }
        if let Some(nested) = buf.strip_prefix('@') {
            read_response_file(nested, depth + 1, out)?;
        } else {
            out.push(buf);
        }
    }
    Ok(())
}

/// Searches `-L` paths for `lib<name>` as a text stub, dylib or archive,
/// in that order per directory.
pub fn find_library(opts: &LinkOptions, name: &str) -> Option<String> {
    for dir in &opts.library_paths {
        for ext in ["tbd", "dylib", "a"] {
            let path = format!("{}/lib{}.{}", dir, name, ext);
            if Path::new(&path).is_file() {
                return Some(path);
            }
        }
    }
    None
}

pub fn find_framework(opts: &LinkOptions, name: &str) -> Option<String> {
    for dir in &opts.framework_paths {
        let base = format!("{}/{}.framework/{}", dir, name, name);
        for candidate in [format!("{}.tbd", base), base] {
            if Path::new(&candidate).is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn basic_options() {
        let parsed = parse_args(&args(&[
            "-arch",
            "arm64",
            "-o",
            "out",
            "-e",
            "_start",
            "-dead_strip",
            "-lSystem",
            "main.o",
        ]))
        .unwrap();
        assert_eq!(parsed.opts.output, "out");
        assert_eq!(parsed.opts.entry, "_start");
        assert!(parsed.opts.dead_strip);
        assert_eq!(parsed.output_type, MH_EXECUTE);
        assert_eq!(
            parsed.inputs,
            vec![
                InputSpec::Lib {
                    name: "System".to_string(),
                    needed: false
                },
                InputSpec::File("main.o".to_string()),
            ]
        );
        // executables get the default 4 GiB page zero
        assert_eq!(parsed.opts.pagezero_size, 0x1_0000_0000);
        // and ARM64 defaults to ad-hoc signing
        assert!(parsed.opts.adhoc_codesign);
    }

    #[test]
    fn dylib_has_no_pagezero() {
        let parsed = parse_args(&args(&["-dylib", "-arch", "x86_64"])).unwrap();
        assert_eq!(parsed.output_type, MH_DYLIB);
        assert_eq!(parsed.opts.pagezero_size, 0);
        assert!(!parsed.opts.adhoc_codesign);
    }

    #[test]
    fn hex_options() {
        let parsed = parse_args(&args(&["-headerpad", "400"])).unwrap();
        assert_eq!(parsed.opts.headerpad, 0x400);
        assert!(parse_args(&args(&["-headerpad", "zz"])).is_err());
        assert!(parse_args(&args(&["-pagezero_size", "1000", "-dylib"])).is_err());
    }

    #[test]
    fn platform_version_triplet() {
        let parsed =
            parse_args(&args(&["-platform_version", "macos", "12.0", "13.1"])).unwrap();
        assert_eq!(parsed.opts.platform, crate::mach::constants::PLATFORM_MACOS);
        assert_eq!(parsed.opts.platform_min_version, 0x000c_0000);
        assert_eq!(parsed.opts.platform_sdk_version, 0x000d_0100);
    }

    #[test]
    fn unknown_option_is_fatal() {
        assert!(parse_args(&args(&["-bogus_flag"])).is_err());
    }

    #[test]
    fn response_file_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsp");
        fs::write(&path, "a.o 'b c.o' d\\ e.o\n-lSystem").unwrap();
        let expanded = expand_response_files(vec![
            format!("@{}", path.display()),
            "tail.o".to_string(),
        ])
        .unwrap();
        assert_eq!(expanded, vec!["a.o", "b c.o", "d e.o", "-lSystem", "tail.o"]);
    }
}
