use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Parser};
use log::{error, info};
use matefix::{run, Outcome, RevertOptions, SortOrder};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Restore original base qualities and add mate CIGARs to a SAM/BAM file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Input SAM or BAM file.
    #[clap(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Output file; `.sam` writes SAM, anything else BAM.
    #[clap(short = 'o', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// Sort order of the output (unknown, unsorted, queryname, coordinate).
    /// Defaults to the order declared by the input.
    #[clap(long = "sort-order")]
    sort_order: Option<SortOrder>,

    /// Replace base qualities with the OQ field when present.
    #[clap(long = "restore-original-qualities", default_value_t = true, action = ArgAction::Set)]
    restore_original_qualities: bool,

    /// Records to scan before deciding whether the input needs processing.
    /// 0 always processes the input.
    #[clap(long = "max-records-to-examine", default_value_t = 10000)]
    max_records_to_examine: usize,

    /// Records held in memory while sorting.
    #[clap(long = "max-records-in-ram", default_value_t = 500000)]
    max_records_in_ram: usize,

    /// Directory for temporary sort files.
    #[clap(long = "tmp-dir", value_name = "DIR")]
    tmp_dir: Option<PathBuf>,

    /// Write `<output>.md5` next to the output.
    #[clap(long = "create-md5", default_value_t = true, action = ArgAction::Set)]
    create_md5: bool,

    /// Only report warnings and errors.
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,
}

impl Args {
    fn options(&self) -> RevertOptions {
        let mut opts = RevertOptions::default()
            .with_restore_original_qualities(self.restore_original_qualities)
            .with_max_records_to_examine(self.max_records_to_examine)
            .with_max_records_in_ram(self.max_records_in_ram)
            .with_create_md5(self.create_md5)
            .with_show_progress(!self.quiet);
        if let Some(order) = self.sort_order {
            opts = opts.with_sort_order(order);
        }
        if let Some(dir) = &self.tmp_dir {
            opts = opts.with_temp_dir(dir);
        }
        opts
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match revert(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn revert(args: &Args) -> Result<()> {
    match run(&args.input, &args.output, &args.options())? {
        Outcome::Skipped(_) => info!(
            "Nothing to do for {}; no output written",
            args.input.display()
        ),
        Outcome::Completed(stats) => info!("Finished: {}", stats),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["matefix", "-i", "in.bam", "-o", "out.bam"]);
        let opts = args.options();
        assert!(opts.restore_original_qualities);
        assert!(opts.create_md5);
        assert_eq!(opts.max_records_to_examine, 10000);
        assert_eq!(opts.max_records_in_ram, 500000);
        assert_eq!(opts.sort_order, None);
        assert!(opts.temp_dir.is_none());
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "matefix",
            "-i",
            "in.sam",
            "-o",
            "out.sam",
            "--sort-order",
            "coordinate",
            "--restore-original-qualities",
            "false",
            "--create-md5",
            "false",
            "--max-records-in-ram",
            "10",
            "--tmp-dir",
            "/tmp",
            "-q",
        ]);
        let opts = args.options();
        assert_eq!(opts.sort_order, Some(SortOrder::Coordinate));
        assert!(!opts.restore_original_qualities);
        assert!(!opts.create_md5);
        assert!(!opts.show_progress);
        assert_eq!(opts.max_records_in_ram, 10);
        assert_eq!(opts.temp_dir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_rejects_unknown_sort_order() {
        let parsed =
            Args::try_parse_from(["matefix", "-i", "a", "-o", "b", "--sort-order", "by-cell"]);
        assert!(parsed.is_err());
    }
}
