//! Transfer counters report and throughput estimation.
//!
//! One printer serves three audiences: the final report, the info-signal
//! progress dump (which adds throughput-so-far and an ETA), and the
//! interrupt dump.  Everything goes to stderr so the data path on stdout
//! stays clean.

use crate::cli::constants::xfer_report_suppressed;
use crate::opts::Opts;

/// Prints the records-in/out counters plus error tallies.
///
/// `mid_run` adds the remaining-block count to the records-in line, which
/// only makes sense while the copy is still going.
pub fn print_stats(opts: &Opts, mid_run: bool) {
    if mid_run && opts.dd_count > 0 {
        eprintln!(
            "{}+{} records in (remaining {})",
            opts.in_full, opts.in_partial, opts.dd_count
        );
    } else {
        eprintln!("{}+{} records in", opts.in_full, opts.in_partial);
    }
    eprintln!("{}+{} records out", opts.out_full, opts.out_partial);
    if opts.oflag.sparse > 0 || opts.out_sparse > 0 || opts.out_sparse_partial > 0 {
        eprintln!(
            "{}+{} bypassed records out",
            opts.out_sparse, opts.out_sparse_partial
        );
    }
    if opts.recovered_errs > 0 || opts.unrecovered_errs > 0 {
        eprintln!(
            "{} recovered read errors, {} unrecovered read errors",
            opts.recovered_errs, opts.unrecovered_errs
        );
    }
    if opts.wr_recovered_errs > 0 || opts.wr_unrecovered_errs > 0 {
        eprintln!(
            "{} recovered write errors, {} unrecovered write errors",
            opts.wr_recovered_errs, opts.wr_unrecovered_errs
        );
    }
    if opts.trim_errs > 0 {
        eprintln!("{} trim errors", opts.trim_errs);
    }
    if opts.num_retries > 0 || opts.interrupted_retries > 0 {
        eprintln!(
            "{} pass-through retries, {} interrupted syscalls retried",
            opts.num_retries, opts.interrupted_retries
        );
    }
    if opts.highest_unrecovered >= 0 {
        eprintln!(
            "lowest unrecovered lba=0x{:x}, highest unrecovered lba=0x{:x}",
            opts.lowest_unrecovered, opts.highest_unrecovered
        );
        if opts.lowest_skip >= 0 {
            eprintln!(
                "first trouble at skip={}, seek={}; a retry can start there",
                opts.lowest_skip, opts.lowest_seek
            );
        }
    }
}

/// Prints elapsed time and throughput; with `with_eta`, also the estimated
/// time remaining derived from the remaining block count.
///
/// Suppressed entirely by `status=noxfer`.
pub fn print_throughput(opts: &Opts, with_eta: bool) {
    if xfer_report_suppressed() {
        return;
    }
    let Some(secs) = opts.elapsed_secs() else {
        return;
    };
    let bytes = opts.in_full.max(0) as u64 * opts.ibs as u64;
    if secs > 0.0 && bytes > 0 {
        let rate = bytes as f64 / secs;
        eprintln!(
            "{} bytes ({}) copied, {:.4} s, {:.2} MB/s",
            bytes,
            approx_size(bytes),
            secs,
            rate / 1e6
        );
        if with_eta && opts.dd_count > 0 {
            let remaining = opts.dd_count as u64 * opts.ibs as u64;
            let eta = remaining as f64 / rate;
            eprintln!("estimated time remaining: {}", approx_duration(eta));
        }
    } else {
        eprintln!("{} bytes copied, {:.4} s", bytes, secs);
    }
}

/// "1.5 GB" style rendering, decimal units.
fn approx_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1000.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1000.0;
    }
    format!("{size:.1} EB")
}

/// "hh:mm:ss" rendering, rounded up to whole seconds.
fn approx_duration(secs: f64) -> String {
    let total = secs.ceil() as u64;
    let (h, rem) = (total / 3600, total % 3600);
    format!("{:02}:{:02}:{:02}", h, rem / 60, rem % 60)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_size_scales_decimal() {
        assert_eq!(approx_size(0), "0.0 B");
        assert_eq!(approx_size(999), "999.0 B");
        assert_eq!(approx_size(1_500), "1.5 kB");
        assert_eq!(approx_size(2_000_000), "2.0 MB");
        assert_eq!(approx_size(5_120_000_000), "5.1 GB");
    }

    #[test]
    fn approx_duration_rounds_up() {
        assert_eq!(approx_duration(0.0), "00:00:00");
        assert_eq!(approx_duration(0.4), "00:00:01");
        assert_eq!(approx_duration(61.0), "00:01:01");
        assert_eq!(approx_duration(3_600.0), "01:00:00");
        assert_eq!(approx_duration(3_723.2), "01:02:04");
    }

    /// print_stats must never panic on a default (all-zero) record.
    #[test]
    fn print_stats_handles_defaults() {
        let opts = Opts::default();
        print_stats(&opts, false);
        print_stats(&opts, true);
        print_throughput(&opts, true);
    }
}
