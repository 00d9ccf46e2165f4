//! Usage and version text.

use crate::cli::constants::PROG_NAME;

/// Prints the operand summary to stdout.
pub fn print_usage() {
    print!(
        "\
Usage: {PROG_NAME} [operand=value ...] [--help] [--verbose] [--version]

Copies a user-bounded region between storage endpoints, block by block.
Devices reachable over a SCSI pass-through channel get explicit READ/WRITE
commands (with protection information), WRITE SAME/UNMAP trim and
SYNCHRONIZE CACHE.

Operands:
  if=IFILE          input to read ('-' for stdin)
  of=OFILE          output to write ('-' for stdout; '.' or absent discards)
  of2=OFILE2        secondary output (regular file or fifo), mirrors reads
  bs=BS             block size for both sides (excludes ibs=/obs=)
  ibs=BS, obs=BS    per-side block sizes (default 512)
  bpt=BPT[,OBPC]    input blocks per transfer, and output blocks per
                    sparse/sparing comparison chunk (0: whole transfer)
  cdbsz=6|10|12|16|32   SCSI CDB size for pass-through READ/WRITE
  coe=0|1           continue on unrecoverable read errors, zero-filling
  coe_limit=N       abort after N consecutive unrecoverable blocks
  conv=LIST         fdatasync, fsync, noerror, notrunc, null, resume,
                    sparing, sparse, sync, trunc
  count=N           input blocks to copy (-1: derive from capacities)
  iflag=LIST        input-side flags (see below)
  oflag=LIST        output-side flags (see below)
  intio=0|1         0 masks signals during I/O (default); 1 allows EINTR
  skip=N, iseek=N   input block offset
  seek=N, oseek=N   output block offset
  protect=RDP[,WRP] RDPROTECT/WRPROTECT fields (0..7)
  retries=N         pass-through retries on unit attention/aborted command
  status=noxfer     suppress the throughput line
  verbose=N         verbosity (negative: quiet, stderr to the null sink)

Flags: append coe direct dpo errblk excl fdatasync flock force fsync fua
  fua_nv ignoreew nocache nofm norcap nowrite null pad pre-alloc pt rarc
  resume self sparing sparse ssync strunc sync trim/unmap trunc
"
    );
}

/// Prints the version line to stdout.
pub fn print_version() {
    println!("{PROG_NAME} {}", env!("CARGO_PKG_VERSION"));
}
