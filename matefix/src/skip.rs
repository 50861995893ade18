//! Early-exit check: decides from the first records of a file whether the
//! whole pipeline can be bypassed.

use std::io;
use std::path::Path;

use anyhow::Result;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::RecordBuf;

use crate::io::open_alignments;

/// Outcome of scanning the head of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanSkip {
    /// No original qualities to restore and mate CIGARs already present.
    CanSkip,
    /// A record carries original qualities that must be restored.
    CannotSkipFoundOq,
    /// A record with a mapped mate has no mate CIGAR.
    CannotSkipFoundNoMc,
    /// The scan limit was reached without a decisive record.
    FoundNoEvidence,
}

impl CanSkip {
    pub fn can_skip(&self) -> bool {
        matches!(self, CanSkip::CanSkip)
    }

    pub fn message(&self, max_records_to_examine: usize) -> String {
        match self {
            CanSkip::CanSkip => "Can skip the BAM file".to_string(),
            CanSkip::CannotSkipFoundOq => {
                "Cannot skip the BAM as we found a record with an OQ".to_string()
            }
            CanSkip::CannotSkipFoundNoMc => {
                "Cannot skip the BAM as we found a mate with no mate cigar tag".to_string()
            }
            CanSkip::FoundNoEvidence => format!(
                "Found no evidence of OQ or mate with no mate cigar in the first {} records. Will continue...",
                max_records_to_examine
            ),
        }
    }
}

/// Examine at most `max_records_to_examine` records.
///
/// The scan stops at the first record with an `OQ` field (when restoring) or
/// at the first record whose mate is mapped, which settles the question for
/// the whole file. An exhausted stream can always be skipped. A limit of zero
/// disables skipping.
pub fn can_skip<I>(
    records: I,
    max_records_to_examine: usize,
    restore_original_qualities: bool,
) -> Result<CanSkip>
where
    I: IntoIterator<Item = io::Result<RecordBuf>>,
{
    if max_records_to_examine == 0 {
        return Ok(CanSkip::FoundNoEvidence);
    }

    let mut records = records.into_iter().peekable();
    let mut num_examined = 0;
    while num_examined < max_records_to_examine {
        let record = match records.next() {
            Some(record) => record?,
            None => return Ok(CanSkip::CanSkip),
        };

        if restore_original_qualities
            && record.data().get(&Tag::ORIGINAL_QUALITY_SCORES).is_some()
        {
            return Ok(CanSkip::CannotSkipFoundOq);
        }

        let flags = record.flags();
        if flags.is_segmented() && !flags.is_mate_unmapped() {
            return if record.data().get(&Tag::MATE_CIGAR).is_some() {
                Ok(CanSkip::CanSkip)
            } else {
                Ok(CanSkip::CannotSkipFoundNoMc)
            };
        }

        num_examined += 1;
    }

    if records.peek().is_none() {
        Ok(CanSkip::CanSkip)
    } else {
        Ok(CanSkip::FoundNoEvidence)
    }
}

/// Run [`can_skip`] on a fresh reader over `path`.
pub fn can_skip_file<P: AsRef<Path>>(
    path: P,
    max_records_to_examine: usize,
    restore_original_qualities: bool,
) -> Result<CanSkip> {
    let (_, records) = open_alignments(path)?;
    can_skip(records, max_records_to_examine, restore_original_qualities)
}
