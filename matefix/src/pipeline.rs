use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::Header;

use crate::extsort::{BamCodec, ExternalSorter};
use crate::io::{
    assert_readable, assert_writable, create_alignment_writer, open_alignments, write_md5_file,
};
use crate::mate::MateInfoIter;
use crate::normalize::RecordNormalizer;
use crate::skip::{can_skip_file, CanSkip};
use crate::sort_order::{coordinate_cmp, query_name_cmp, sort_order, with_sort_order, SortOrder};

#[derive(Debug, Clone)]
pub struct RevertOptions {
    /// Sort order of the output. Defaults to the order declared by the input.
    pub sort_order: Option<SortOrder>,
    pub restore_original_qualities: bool,
    /// Records scanned before deciding whether the file can be skipped.
    pub max_records_to_examine: usize,
    /// Records held in memory by each sort before spilling to disk.
    pub max_records_in_ram: usize,
    pub temp_dir: Option<PathBuf>,
    pub create_md5: bool,
    pub show_progress: bool,
}

impl Default for RevertOptions {
    fn default() -> Self {
        Self {
            sort_order: None,
            restore_original_qualities: true,
            max_records_to_examine: 10000,
            max_records_in_ram: 500000,
            temp_dir: None,
            create_md5: false,
            show_progress: false,
        }
    }
}

impl RevertOptions {
    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = Some(sort_order);
        self
    }

    pub fn with_restore_original_qualities(mut self, restore: bool) -> Self {
        self.restore_original_qualities = restore;
        self
    }

    pub fn with_max_records_to_examine(mut self, n: usize) -> Self {
        self.max_records_to_examine = n;
        self
    }

    pub fn with_max_records_in_ram(mut self, n: usize) -> Self {
        self.max_records_in_ram = n;
        self
    }

    pub fn with_temp_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.temp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_create_md5(mut self, create_md5: bool) -> Self {
        self.create_md5 = create_md5;
        self
    }

    pub fn with_show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertStats {
    pub num_records: u64,
    pub num_qualities_restored: u64,
    pub num_cigars_repaired: u64,
    pub num_mate_cigars_added: u64,
    pub found_paired_mapped: bool,
}

impl fmt::Display for RevertStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records: {}, qualities restored: {}, cigars repaired: {}, mate cigars added: {}",
            self.num_records,
            self.num_qualities_restored,
            self.num_cigars_repaired,
            self.num_mate_cigars_added
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do. No output was written.
    Skipped(CanSkip),
    Completed(RevertStats),
}

type RecordCmp = fn(&RecordBuf, &RecordBuf) -> Ordering;

fn record_sorter(
    header: &Arc<Header>,
    opts: &RevertOptions,
    compare: RecordCmp,
) -> ExternalSorter<BamCodec, RecordCmp> {
    let sorter = ExternalSorter::new(
        BamCodec::new(header.clone()),
        opts.max_records_in_ram,
        compare,
    );
    match &opts.temp_dir {
        Some(dir) => sorter.with_tmp_dir(dir),
        None => sorter,
    }
}

fn progress_bar(show: bool) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::with_template("[{elapsed}] {spinner} {human_pos} records {msg}")?;
    Ok(ProgressBar::new_spinner().with_style(style))
}

/// Restore original base qualities, repair off-end alignments and add mate
/// information to every pair in `input`, writing the result to `output`.
///
/// The head of the input is scanned first. If it shows the file needs no
/// change, the run stops and `output` is not created.
pub fn run<P1, P2>(input: P1, output: P2, opts: &RevertOptions) -> Result<Outcome>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let input = input.as_ref();
    let output = output.as_ref();
    assert_readable(input)?;
    assert_writable(output)?;
    if let Some(dir) = &opts.temp_dir {
        ensure!(dir.is_dir(), "temporary directory does not exist: {}", dir.display());
    }

    let decision = can_skip_file(
        input,
        opts.max_records_to_examine,
        opts.restore_original_qualities,
    )?;
    info!("{}", decision.message(opts.max_records_to_examine));
    if decision.can_skip() {
        return Ok(Outcome::Skipped(decision));
    }

    let (input_header, records) = open_alignments(input)?;
    let order = opts
        .sort_order
        .or_else(|| sort_order(&input_header))
        .unwrap_or(SortOrder::Unknown);
    let header = Arc::new(with_sort_order(&input_header, order));
    debug!("Output sort order: {}", order);

    let progress = progress_bar(opts.show_progress)?;
    progress.set_message("read");

    let mut stats = RevertStats::default();
    let mut normalizer = RecordNormalizer::new(&header, opts.restore_original_qualities);
    let mut sorter = record_sorter(&header, opts, query_name_cmp);
    for record in records {
        let mut record =
            record.with_context(|| format!("cannot read record from {}", input.display()))?;
        normalizer.normalize(&mut record)?;
        sorter.add(record)?;
        stats.num_records += 1;
        progress.inc(1);
    }
    stats.num_qualities_restored = normalizer.num_qualities_restored();
    stats.num_cigars_repaired = normalizer.num_cigars_repaired();
    stats.found_paired_mapped = normalizer.found_paired_mapped();
    debug!("Sorted {} records into {} runs", stats.num_records, sorter.num_runs());

    progress.set_position(0);
    progress.set_message("written");

    let mut mates = MateInfoIter::new(sorter.finish()?);
    let mut writer = create_alignment_writer(output)?;
    writer
        .write_alignment_header(&header)
        .with_context(|| format!("cannot write header to {}", output.display()))?;

    if order == SortOrder::Coordinate {
        let mut resorter = record_sorter(&header, opts, coordinate_cmp);
        for record in mates.by_ref() {
            resorter.add(record.context("cannot read sorted records")?)?;
        }
        for record in resorter.finish()? {
            let record = record.context("cannot read sorted records")?;
            writer
                .write_alignment_record(&header, &record)
                .with_context(|| format!("cannot write record to {}", output.display()))?;
            progress.inc(1);
        }
    } else {
        for record in mates.by_ref() {
            let record = record.context("cannot read sorted records")?;
            writer
                .write_alignment_record(&header, &record)
                .with_context(|| format!("cannot write record to {}", output.display()))?;
            progress.inc(1);
        }
    }
    writer
        .finish(&header)
        .with_context(|| format!("cannot finish {}", output.display()))?;
    drop(writer);
    progress.finish_and_clear();
    stats.num_mate_cigars_added = mates.num_mate_cigars_added();

    if opts.create_md5 {
        write_md5_file(output)?;
    }

    info!(
        "Reverted the original base qualities for {} records",
        stats.num_qualities_restored
    );
    info!("Updated {} records with mate cigar", stats.num_mate_cigars_added);
    if stats.num_cigars_repaired > 0 {
        info!(
            "Clipped {} alignments running off the end of their reference",
            stats.num_cigars_repaired
        );
    }
    if !stats.found_paired_mapped {
        info!("Did not find any paired mapped reads.");
    }

    Ok(Outcome::Completed(stats))
}
