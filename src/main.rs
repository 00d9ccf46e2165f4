//! Binary entry point for `ptdd`.
//!
//! Control flow: parse operands, open the endpoints, resolve the count,
//! install the signal broker, run the copy loop, finalise, report.  Every
//! failure is printed once with the program-name prefix and turned into its
//! category's exit code; a non-fatal error noted during the copy surfaces
//! as the exit code when everything else ended cleanly.

use ptdd::cli::args::{parse_args, ParsedArgs};
use ptdd::cli::constants::{verbosity, PROG_NAME};
use ptdd::error::Result;
use ptdd::io::calc::calc_count;
use ptdd::io::copy::{do_copy, finish};
use ptdd::io::errblk::ErrblkLog;
use ptdd::io::open::{open_input, open_output, open_output2, prealloc_output};
use ptdd::io::stats::{print_stats, print_throughput};
use ptdd::opts::Opts;
use ptdd::signals::SignalBroker;

/// Points stderr at the null sink (`verbose=` below zero).
fn silence_stderr() {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    // SAFETY: plain open/dup2 on our own descriptors.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        if fd >= 0 {
            libc::dup2(fd, 2);
            libc::close(fd);
        }
    }
}

fn run_inner(opts: &mut Opts) -> Result<()> {
    open_input(opts)?;
    open_output(opts)?;
    open_output2(opts)?;
    if opts.iflag.errblk {
        opts.errblk = Some(
            ErrblkLog::open()
                .map_err(|e| ptdd::Error::file(format!("errblk log: {e}")))?,
        );
    }
    calc_count(opts)?;
    prealloc_output(opts)?;

    let broker = SignalBroker::install(opts.interrupt_io)
        .map_err(|e| ptdd::Error::other(format!("signal setup: {e}")))?;
    do_copy(opts, Some(&broker))?;
    finish(opts)?;
    Ok(())
}

fn run(parsed: ParsedArgs) -> i32 {
    let mut opts = parsed.opts;
    if parsed.quiet_stderr {
        silence_stderr();
    }
    let code = match run_inner(&mut opts) {
        Ok(()) => opts.err_to_report,
        Err(e) => {
            eprintln!("{PROG_NAME}: {e}");
            e.category.exit_code()
        }
    };
    if opts.start_tm.is_some() && verbosity() >= 0 {
        print_stats(&opts, false);
        print_throughput(&opts, false);
    }
    code
}

fn main() {
    let parsed = match parse_args() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{PROG_NAME}: {e}");
            eprintln!("try '{PROG_NAME} --help' for the operand list");
            std::process::exit(ptdd::Category::Syntax.exit_code());
        }
    };
    if parsed.exit_early {
        std::process::exit(0);
    }
    std::process::exit(run(parsed));
}
