use machld::arch::{Arm64, X8664};
use machld::cmdline::{expand_response_files, parse_args, HELP};
use machld::error::Result;
use machld::mach::constants::cputype;

fn run(args: Vec<String>) -> Result<()> {
    let args = expand_response_files(args)?;
    let parsed = parse_args(&args)?;

    if parsed.print_help {
        println!("Usage: machld [options] file...\n{}", HELP);
        return Ok(());
    }
    if parsed.print_version {
        println!("machld {}", machld::VERSION);
        return Ok(());
    }
    if parsed.inputs.is_empty() {
        return Err(machld::error::Error::Malformed(
            "no input files".to_string(),
        ));
    }

    match parsed.opts.arch {
        cputype::CPU_TYPE_ARM64 => {
            machld::driver::link::<Arm64>(parsed.opts, parsed.output_type, &parsed.inputs)
        }
        cputype::CPU_TYPE_X86_64 => {
            machld::driver::link::<X8664>(parsed.opts, parsed.output_type, &parsed.inputs)
        }
        _ => unreachable!("unsupported architecture"),
    }
}

fn main() {
    use std::io::Write;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{}: {}",
                record.level().to_string().to_lowercase(),
                record.args()
            )
        })
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = run(args) {
        // accumulated errors were already reported as they happened
        if !matches!(err, machld::error::Error::LinkFailed) {
            eprintln!("machld: error: {}", err);
        }
        std::process::exit(1);
    }
}
