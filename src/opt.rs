//! The configuration record produced by the command line front end, and
//! the platform/version codecs shared with the TBD reader.

use crate::error::{Error, Result};
use crate::mach::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    None,
    /// derive the UUID from a hash of the output
    Hash,
}

/// Everything the option parser decides. Field names follow the options
/// they come from.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub output: String,
    /// identity recorded in LC_ID_DYLIB and the code signature
    pub final_output: String,
    pub entry: String,
    pub arch: u32,
    pub uuid: UuidKind,
    pub objc: bool,
    pub adhoc_codesign: bool,
    pub application_extension: bool,
    pub dead_strip: bool,
    pub dead_strip_dylibs: bool,
    pub deduplicate: bool,
    pub function_starts: bool,
    pub mark_dead_strippable_dylib: bool,
    pub trace: bool,
    pub compatibility_version: u32,
    pub current_version: u32,
    pub headerpad: u64,
    pub pagezero_size: u64,
    pub platform: u32,
    pub platform_min_version: u32,
    pub platform_sdk_version: u32,
    pub stack_size: u64,
    pub map: String,
    pub lto_library: String,
    pub add_ast_path: Vec<String>,
    pub framework_paths: Vec<String>,
    pub library_paths: Vec<String>,
    pub rpath: Vec<String>,
    pub syslibroot: Vec<String>,
}

impl Default for LinkOptions {
    fn default() -> LinkOptions {
        LinkOptions {
            output: "a.out".to_string(),
            final_output: String::new(),
            entry: "_main".to_string(),
            arch: cputype::CPU_TYPE_ARM64,
            uuid: UuidKind::Hash,
            objc: false,
            adhoc_codesign: false,
            application_extension: false,
            dead_strip: false,
            dead_strip_dylibs: false,
            deduplicate: true,
            function_starts: true,
            mark_dead_strippable_dylib: false,
            trace: false,
            compatibility_version: 0,
            current_version: 0,
            headerpad: 256,
            pagezero_size: 0,
            platform: PLATFORM_MACOS,
            platform_min_version: 0,
            platform_sdk_version: 0,
            stack_size: 0,
            map: String::new(),
            lto_library: String::new(),
            add_ast_path: Vec::new(),
            framework_paths: Vec::new(),
            library_paths: Vec::new(),
            rpath: Vec::new(),
            syslibroot: Vec::new(),
        }
    }
}

impl LinkOptions {
    /// The name the output is known by: `-final_output` if given,
    /// otherwise `-o`.
    pub fn final_output(&self) -> &str {
        if self.final_output.is_empty() {
            &self.output
        } else {
            &self.final_output
        }
    }
}

/// Parses a platform name or bare number for `-platform_version`.
pub fn parse_platform(arg: &str) -> Result<u32> {
    if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        return arg
            .parse()
            .map_err(|_| Error::Malformed(format!("bad platform number: {}", arg)));
    }
    match arg {
        "macos" => Ok(PLATFORM_MACOS),
        "ios" => Ok(PLATFORM_IOS),
        "tvos" => Ok(PLATFORM_TVOS),
        "watchos" => Ok(PLATFORM_WATCHOS),
        "bridgeos" => Ok(PLATFORM_BRIDGEOS),
        "mac-catalyst" => Ok(PLATFORM_MACCATALYST),
        "ios-simulator" => Ok(PLATFORM_IOSSIMULATOR),
        "tvos-simulator" => Ok(PLATFORM_TVOSSIMULATOR),
        "watchos-simulator" => Ok(PLATFORM_WATCHOSSIMULATOR),
        "driverkit" => Ok(PLATFORM_DRIVERKIT),
        _ => Err(Error::Malformed(format!(
            "unknown -platform_version name: {}",
            arg
        ))),
    }
}

pub fn platform_to_str(platform: u32) -> Option<&'static str> {
    Some(match platform {
        PLATFORM_MACOS => "macos",
        PLATFORM_IOS => "ios",
        PLATFORM_TVOS => "tvos",
        PLATFORM_WATCHOS => "watchos",
        PLATFORM_BRIDGEOS => "bridgeos",
        PLATFORM_MACCATALYST => "mac-catalyst",
        PLATFORM_IOSSIMULATOR => "ios-simulator",
        PLATFORM_TVOSSIMULATOR => "tvos-simulator",
        PLATFORM_WATCHOSSIMULATOR => "watchos-simulator",
        PLATFORM_DRIVERKIT => "driverkit",
        _ => return None,
    })
}

/// Parses `MAJOR[.MINOR[.PATCH]]` into the packed
/// `(major << 16) | (minor << 8) | patch` form load commands use.
pub fn parse_version(arg: &str) -> Result<u32> {
    let bad = || Error::Malformed(format!("malformed version number: {}", arg));
    let mut parts = arg.split('.');
    let mut next = |max: u32| -> Result<u32> {
        match parts.next() {
            None => Ok(0),
            Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                let n: u32 = s.parse().map_err(|_| bad())?;
                if n > max {
                    Err(bad())
                } else {
                    Ok(n)
                }
            }
            Some(_) => Err(bad()),
        }
    };
    let major = next(0xffff)?;
    let minor = next(0xff)?;
    let patch = next(0xff)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((major << 16) | (minor << 8) | patch)
}

/// Renders a packed version back into its canonical `x.y.z` spelling.
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 16,
        (version >> 8) & 0xff,
        version & 0xff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing() {
        assert_eq!(parse_version("10.14.2").unwrap(), 0x000a0e02);
        assert_eq!(parse_version("12").unwrap(), 0x000c0000);
        assert_eq!(parse_version("1.2").unwrap(), 0x00010200);
        assert!(parse_version("1.2.3.4").is_err());
        assert!(parse_version("").is_err());
        assert!(parse_version("1.x").is_err());
        assert!(parse_version("1.300").is_err());
    }

    #[test]
    fn version_roundtrip() {
        // format(parse(s)) equals the zero-extended canonical spelling
        for (input, canonical) in [
            ("10.14.2", "10.14.2"),
            ("12", "12.0.0"),
            ("1.2", "1.2.0"),
            ("0.0.1", "0.0.1"),
        ] {
            assert_eq!(format_version(parse_version(input).unwrap()), canonical);
        }
    }

    #[test]
    fn platform_roundtrip() {
        for name in [
            "macos",
            "ios",
            "tvos",
            "watchos",
            "bridgeos",
            "mac-catalyst",
            "ios-simulator",
            "tvos-simulator",
            "watchos-simulator",
            "driverkit",
        ] {
            let id = parse_platform(name).unwrap();
            assert_eq!(platform_to_str(id), Some(name));
        }
        assert_eq!(parse_platform("11").unwrap(), 11);
        assert!(parse_platform("nextstep").is_err());
    }
}
