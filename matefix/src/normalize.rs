use anyhow::{bail, ensure, Context, Result};
use bstr::BString;
use log::debug;
use noodles::sam::alignment::record::cigar::{op::Kind, Op};
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{Cigar, QualityScores};
use noodles::sam::alignment::RecordBuf;
use noodles::sam::Header;

/// Number of reference bases covered by the alignment.
pub fn reference_length(cigar: &Cigar) -> usize {
    cigar
        .as_ref()
        .iter()
        .filter(|op| op.kind().consumes_reference())
        .map(|op| op.len())
        .sum()
}

/// Per-record streaming transform applied before records are sorted.
pub struct RecordNormalizer<'a> {
    header: &'a Header,
    restore_original_qualities: bool,
    num_qualities_restored: u64,
    num_cigars_repaired: u64,
    found_paired_mapped: bool,
}

impl<'a> RecordNormalizer<'a> {
    pub fn new(header: &'a Header, restore_original_qualities: bool) -> Self {
        Self {
            header,
            restore_original_qualities,
            num_qualities_restored: 0,
            num_cigars_repaired: 0,
            found_paired_mapped: false,
        }
    }

    pub fn normalize(&mut self, record: &mut RecordBuf) -> Result<()> {
        if repair_off_end_alignment(record, self.header)? {
            self.num_cigars_repaired += 1;
        }

        if self.restore_original_qualities && restore_original_qualities(record)? {
            self.num_qualities_restored += 1;
        }

        let flags = record.flags();
        if flags.is_segmented() && !flags.is_unmapped() {
            self.found_paired_mapped = true;
        }
        Ok(())
    }

    pub fn num_qualities_restored(&self) -> u64 {
        self.num_qualities_restored
    }

    pub fn num_cigars_repaired(&self) -> u64 {
        self.num_cigars_repaired
    }

    /// Whether any paired record that is itself mapped has been seen.
    pub fn found_paired_mapped(&self) -> bool {
        self.found_paired_mapped
    }
}

/// Replace the working qualities with the `OQ` field and drop the field.
/// Returns `false` when the record carries no `OQ` field.
pub fn restore_original_qualities(record: &mut RecordBuf) -> Result<bool> {
    let scores = match record.data().get(&Tag::ORIGINAL_QUALITY_SCORES) {
        None => return Ok(false),
        Some(Value::String(oq)) => decode_quality_string(oq).with_context(|| {
            format!("invalid OQ field in record {:?}", record.name())
        })?,
        Some(value) => bail!(
            "OQ field of record {:?} is not a string: {:?}",
            record.name(),
            value
        ),
    };
    let sequence_length = record.sequence().len();
    ensure!(
        sequence_length == 0 || scores.len() == sequence_length,
        "OQ field of record {:?} has {} qualities but the sequence has {} bases",
        record.name(),
        scores.len(),
        sequence_length
    );
    *record.quality_scores_mut() = QualityScores::from(scores);
    record.data_mut().remove(&Tag::ORIGINAL_QUALITY_SCORES);
    Ok(true)
}

fn decode_quality_string(s: &BString) -> Result<Vec<u8>> {
    s.iter()
        .map(|&c| {
            c.checked_sub(33)
                .with_context(|| format!("invalid quality character: {}", c))
        })
        .collect()
}

/// Soft-clip the part of an alignment that extends past the end of its
/// reference sequence. Returns `true` if the CIGAR was rewritten.
///
/// Unmapped records and records that fit are left untouched. A mapped record
/// whose reference cannot be resolved, or that starts beyond the end of its
/// reference, is an error.
pub fn repair_off_end_alignment(record: &mut RecordBuf, header: &Header) -> Result<bool> {
    if record.flags().is_unmapped() {
        return Ok(false);
    }

    let reference_sequence_id = record
        .reference_sequence_id()
        .with_context(|| format!("mapped record {:?} has no reference sequence", record.name()))?;
    let reference_sequence_length = header
        .reference_sequences()
        .get_index(reference_sequence_id)
        .map(|(_, rs)| rs.length().get())
        .with_context(|| {
            format!(
                "reference sequence index {} of record {:?} is not in the header",
                reference_sequence_id,
                record.name()
            )
        })?;
    let alignment_start = record
        .alignment_start()
        .with_context(|| format!("mapped record {:?} has no alignment start", record.name()))?
        .get();
    ensure!(
        alignment_start <= reference_sequence_length,
        "record {:?} starts at {} beyond the end of its reference sequence ({})",
        record.name(),
        alignment_start,
        reference_sequence_length
    );

    let span = reference_length(record.cigar());
    if span == 0 || alignment_start + span - 1 <= reference_sequence_length {
        return Ok(false);
    }

    let keep = reference_sequence_length - alignment_start + 1;
    let cigar = clip_alignment_end(record.cigar().as_ref(), keep).with_context(|| {
        format!("cannot clip the alignment of record {:?}", record.name())
    })?;
    debug!(
        "Clipped {} reference bases off the end of {:?}",
        span - keep,
        record.name()
    );
    *record.cigar_mut() = cigar;
    Ok(true)
}

/// Keep the first `keep` reference bases of the alignment and turn every read
/// base after them into a soft clip. Deletions and skips past the clip point
/// are dropped; an insertion left dangling at the clip point joins the clip.
/// Trailing hard clips are preserved.
fn clip_alignment_end(ops: &[Op], keep: usize) -> Result<Cigar> {
    let mut clipped = Vec::with_capacity(ops.len() + 1);
    let mut remaining = keep;
    let mut soft_clip = 0;
    let mut hard_clip = 0;

    for op in ops {
        let (kind, len) = (op.kind(), op.len());
        if remaining == 0 {
            if kind == Kind::HardClip {
                hard_clip += len;
            } else if kind.consumes_read() {
                soft_clip += len;
            }
        } else if kind.consumes_reference() {
            if len <= remaining {
                clipped.push(*op);
                remaining -= len;
            } else {
                if kind.consumes_read() {
                    clipped.push(Op::new(kind, remaining));
                    soft_clip += len - remaining;
                }
                remaining = 0;
            }
        } else {
            clipped.push(*op);
        }
    }

    while let Some(last) = clipped.last() {
        match last.kind() {
            Kind::Deletion | Kind::Skip | Kind::Pad => {}
            Kind::Insertion => soft_clip += last.len(),
            _ => break,
        }
        clipped.pop();
    }

    ensure!(
        clipped
            .iter()
            .any(|op| op.kind().consumes_read() && op.kind().consumes_reference()),
        "no aligned bases left before the end of the reference"
    );

    if soft_clip > 0 {
        clipped.push(Op::new(Kind::SoftClip, soft_clip));
    }
    if hard_clip > 0 {
        clipped.push(Op::new(Kind::HardClip, hard_clip));
    }
    Ok(Cigar::from(clipped))
}
