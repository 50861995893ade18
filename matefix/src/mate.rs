//! Mate information for query-name grouped records.
//!
//! Consecutive records sharing a query name form a group. When the group
//! changes, the primary alignments of both ends are located and, if both are
//! mapped, each receives the other's placement, strand, mapping quality,
//! CIGAR (`MC`) and the signed template length. Records leave in input order.

use std::collections::VecDeque;
use std::io;

use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::Cigar;
use noodles::sam::alignment::RecordBuf;
use smallvec::SmallVec;

use crate::normalize::reference_length;

pub struct MateInfoIter<I> {
    records: I,
    group: SmallVec<[RecordBuf; 2]>,
    ready: VecDeque<io::Result<RecordBuf>>,
    num_mate_cigars_added: u64,
    done: bool,
}

impl<I> MateInfoIter<I>
where
    I: Iterator<Item = io::Result<RecordBuf>>,
{
    /// `records` must be grouped by query name.
    pub fn new(records: I) -> Self {
        Self {
            records,
            group: SmallVec::new(),
            ready: VecDeque::new(),
            num_mate_cigars_added: 0,
            done: false,
        }
    }

    /// Number of records that received a mate CIGAR so far.
    pub fn num_mate_cigars_added(&self) -> u64 {
        self.num_mate_cigars_added
    }

    fn flush(&mut self) {
        if self.group.is_empty() {
            return;
        }
        let mut group = std::mem::take(&mut self.group);
        self.num_mate_cigars_added += set_mate_info(&mut group);
        self.ready.extend(group.into_iter().map(Ok));
    }
}

impl<I> Iterator for MateInfoIter<I>
where
    I: Iterator<Item = io::Result<RecordBuf>>,
{
    type Item = io::Result<RecordBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.records.next() {
                Some(Ok(record)) => {
                    if self
                        .group
                        .first()
                        .is_some_and(|first| first.name() != record.name())
                    {
                        self.flush();
                    }
                    self.group.push(record);
                }
                Some(Err(e)) => {
                    self.flush();
                    self.ready.push_back(Err(e));
                    self.done = true;
                }
                None => {
                    self.flush();
                    self.done = true;
                }
            }
        }
    }
}

fn is_primary(record: &RecordBuf) -> bool {
    let flags = record.flags();
    !flags.is_secondary() && !flags.is_supplementary()
}

/// Indices of the primary alignments of the two ends, first segment first.
fn primary_pair(group: &[RecordBuf]) -> Option<(usize, usize)> {
    let first = group
        .iter()
        .position(|r| is_primary(r) && r.flags().is_first_segment());
    let last = group
        .iter()
        .position(|r| is_primary(r) && r.flags().is_last_segment());
    if let (Some(i), Some(j)) = (first, last) {
        if i != j {
            return Some((i, j));
        }
    }

    let primaries: SmallVec<[usize; 2]> = group
        .iter()
        .enumerate()
        .filter(|(_, r)| is_primary(r))
        .map(|(i, _)| i)
        .collect();
    match primaries.as_slice() {
        [i, j] => Some((*i, *j)),
        _ => None,
    }
}

/// Returns the number of records given a mate CIGAR.
fn set_mate_info(group: &mut [RecordBuf]) -> u64 {
    let Some((i, j)) = primary_pair(group) else {
        return 0;
    };
    let (r1, r2) = pair_mut(group, i, j);
    if !is_mapped_pair_member(r1) || !is_mapped_pair_member(r2) {
        return 0;
    }

    let mate_of_r2 = MateInfo::from_record(r1);
    let mate_of_r1 = MateInfo::from_record(r2);
    let insert_size = insert_size(r1, r2);
    mate_of_r1.apply(r1, insert_size) + mate_of_r2.apply(r2, -insert_size)
}

fn is_mapped_pair_member(record: &RecordBuf) -> bool {
    let flags = record.flags();
    flags.is_segmented() && !flags.is_unmapped()
}

fn pair_mut(group: &mut [RecordBuf], i: usize, j: usize) -> (&mut RecordBuf, &mut RecordBuf) {
    if i < j {
        let (head, tail) = group.split_at_mut(j);
        (&mut head[i], &mut tail[0])
    } else {
        let (head, tail) = group.split_at_mut(i);
        (&mut tail[0], &mut head[j])
    }
}

struct MateInfo {
    reference_sequence_id: Option<usize>,
    alignment_start: Option<Position>,
    is_reverse_complemented: bool,
    mapping_quality: u8,
    cigar: String,
}

impl MateInfo {
    fn from_record(record: &RecordBuf) -> Self {
        Self {
            reference_sequence_id: record.reference_sequence_id(),
            alignment_start: record.alignment_start(),
            is_reverse_complemented: record.flags().is_reverse_complemented(),
            mapping_quality: record.mapping_quality().map_or(255, u8::from),
            cigar: cigar_string(record.cigar()),
        }
    }

    /// Returns 1 if a mate CIGAR was written.
    fn apply(self, record: &mut RecordBuf, template_length: i32) -> u64 {
        *record.mate_reference_sequence_id_mut() = self.reference_sequence_id;
        *record.mate_alignment_start_mut() = self.alignment_start;
        *record.template_length_mut() = template_length;

        let flags = record.flags_mut();
        flags.remove(Flags::MATE_UNMAPPED);
        flags.set(Flags::MATE_REVERSE_COMPLEMENTED, self.is_reverse_complemented);

        let data = record.data_mut();
        data.insert(Tag::MATE_MAPPING_QUALITY, Value::UInt8(self.mapping_quality));
        if self.cigar == "*" {
            return 0;
        }
        data.insert(Tag::MATE_CIGAR, Value::String(self.cigar.into()));
        1
    }
}

/// SAM text form of a CIGAR; `*` when empty.
pub fn cigar_string(cigar: &Cigar) -> String {
    let ops = cigar.as_ref();
    if ops.is_empty() {
        return "*".to_string();
    }
    let mut s = String::with_capacity(ops.len() * 4);
    for op in ops {
        s.push_str(&op.len().to_string());
        s.push(kind_char(op.kind()));
    }
    s
}

fn kind_char(kind: Kind) -> char {
    match kind {
        Kind::Match => 'M',
        Kind::Insertion => 'I',
        Kind::Deletion => 'D',
        Kind::Skip => 'N',
        Kind::SoftClip => 'S',
        Kind::HardClip => 'H',
        Kind::Pad => 'P',
        Kind::SequenceMatch => '=',
        Kind::SequenceMismatch => 'X',
    }
}

/// 5' position of an alignment: its end when reverse complemented.
fn five_prime_position(record: &RecordBuf) -> i64 {
    let start = record.alignment_start().map_or(0, usize::from) as i64;
    if record.flags().is_reverse_complemented() {
        start + reference_length(record.cigar()) as i64 - 1
    } else {
        start
    }
}

/// Signed distance between the 5' ends of two mapped records, counted
/// inclusively. Zero when they lie on different references.
fn insert_size(r1: &RecordBuf, r2: &RecordBuf) -> i32 {
    if r1.reference_sequence_id() != r2.reference_sequence_id() {
        return 0;
    }
    let first = five_prime_position(r1);
    let second = five_prime_position(r2);
    let adjustment = if second >= first { 1 } else { -1 };
    i32::try_from(second - first + adjustment).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::sam::alignment::record::cigar::Op;
    use noodles::sam::alignment::record::MappingQuality;

    fn mapped(name: &str, flags: Flags, start: usize, ops: &[(Kind, usize)], mapq: u8) -> RecordBuf {
        RecordBuf::builder()
            .set_name(name)
            .set_flags(flags)
            .set_reference_sequence_id(0)
            .set_alignment_start(Position::try_from(start).unwrap())
            .set_mapping_quality(MappingQuality::new(mapq).unwrap())
            .set_cigar(ops.iter().map(|&(k, l)| Op::new(k, l)).collect::<Vec<_>>().into())
            .build()
    }

    fn unmapped(name: &str, flags: Flags) -> RecordBuf {
        RecordBuf::builder()
            .set_name(name)
            .set_flags(flags | Flags::UNMAPPED)
            .build()
    }

    fn r1_flags() -> Flags {
        Flags::SEGMENTED | Flags::FIRST_SEGMENT
    }

    fn r2_flags() -> Flags {
        Flags::SEGMENTED | Flags::LAST_SEGMENT
    }

    fn enrich(records: Vec<RecordBuf>) -> (Vec<RecordBuf>, u64) {
        let mut iter = MateInfoIter::new(records.into_iter().map(Ok));
        let out: Vec<_> = iter.by_ref().map(Result::unwrap).collect();
        (out, iter.num_mate_cigars_added())
    }

    fn mate_cigar(record: &RecordBuf) -> Option<&Value> {
        record.data().get(&Tag::MATE_CIGAR)
    }

    #[test]
    fn test_mapped_pair() {
        let r1 = mapped("q1", r1_flags(), 100, &[(Kind::Match, 10)], 60);
        let r2 = mapped(
            "q1",
            r2_flags() | Flags::REVERSE_COMPLEMENTED | Flags::MATE_UNMAPPED,
            200,
            &[(Kind::SoftClip, 2), (Kind::Match, 8)],
            30,
        );
        let (out, added) = enrich(vec![r1, r2]);
        assert_eq!(added, 2);

        let (r1, r2) = (&out[0], &out[1]);
        assert_eq!(mate_cigar(r1), Some(&Value::String("2S8M".into())));
        assert_eq!(mate_cigar(r2), Some(&Value::String("10M".into())));
        assert_eq!(r1.data().get(&Tag::MATE_MAPPING_QUALITY), Some(&Value::UInt8(30)));
        assert_eq!(r2.data().get(&Tag::MATE_MAPPING_QUALITY), Some(&Value::UInt8(60)));

        // Mate symmetry.
        assert_eq!(r1.mate_reference_sequence_id(), r2.reference_sequence_id());
        assert_eq!(r1.mate_alignment_start(), r2.alignment_start());
        assert_eq!(r2.mate_alignment_start(), r1.alignment_start());
        assert!(r1.flags().is_mate_reverse_complemented());
        assert!(!r2.flags().is_mate_reverse_complemented());
        assert!(!r2.flags().is_mate_unmapped());

        // 5' ends at 100 and 207.
        assert_eq!(r1.template_length(), 108);
        assert_eq!(r2.template_length(), -108);
    }

    #[test]
    fn test_missing_or_unmapped_mate() {
        let lone = mapped("a", r1_flags(), 10, &[(Kind::Match, 10)], 60);
        let r1 = mapped("b", r1_flags() | Flags::MATE_UNMAPPED, 10, &[(Kind::Match, 10)], 60);
        let r2 = unmapped("b", r2_flags());
        let input = vec![lone, r1, r2];
        let (out, added) = enrich(input.clone());
        assert_eq!(added, 0);
        assert_eq!(out, input);
    }

    #[test]
    fn test_secondary_and_supplementary_pass_through() {
        let r1 = mapped("q", r1_flags(), 10, &[(Kind::Match, 10)], 60);
        let r2 = mapped("q", r2_flags(), 50, &[(Kind::Match, 10)], 60);
        let secondary = mapped("q", r1_flags() | Flags::SECONDARY, 500, &[(Kind::Match, 10)], 0);
        let supplementary =
            mapped("q", r2_flags() | Flags::SUPPLEMENTARY, 900, &[(Kind::Match, 5)], 10);
        let (out, added) = enrich(vec![r1, secondary.clone(), r2, supplementary.clone()]);
        assert_eq!(added, 2);
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], secondary);
        assert_eq!(out[3], supplementary);
        assert_eq!(out[0].mate_alignment_start(), out[2].alignment_start());
        assert_eq!(out[0].template_length(), 41);
    }

    #[test]
    fn test_groups_and_order() {
        let records = vec![
            mapped("a", r1_flags(), 10, &[(Kind::Match, 10)], 60),
            mapped("a", r2_flags(), 30, &[(Kind::Match, 10)], 60),
            mapped("b", Flags::empty(), 40, &[(Kind::Match, 10)], 60),
            mapped("c", r1_flags(), 70, &[(Kind::Match, 10)], 60),
            mapped("c", r2_flags(), 20, &[(Kind::Match, 10)], 60),
        ];
        let (out, added) = enrich(records);
        assert_eq!(added, 4);
        let names: Vec<_> = out.iter().map(|r| r.name().unwrap().to_string()).collect();
        assert_eq!(names, ["a", "a", "b", "c", "c"]);
        assert!(mate_cigar(&out[2]).is_none());
        // Mate upstream gives a negative length.
        assert_eq!(out[3].template_length(), -51);
        assert_eq!(out[4].template_length(), 51);
    }

    #[test]
    fn test_different_references() {
        let r1 = mapped("q", r1_flags(), 10, &[(Kind::Match, 10)], 60);
        let mut r2 = mapped("q", r2_flags(), 50, &[(Kind::Match, 10)], 60);
        *r2.reference_sequence_id_mut() = Some(1);
        let (out, _) = enrich(vec![r1, r2]);
        assert_eq!(out[0].mate_reference_sequence_id(), Some(1));
        assert_eq!(out[0].template_length(), 0);
        assert_eq!(out[1].template_length(), 0);
    }

    #[test]
    fn test_error_ends_stream() {
        let records = vec![
            Ok(mapped("a", r1_flags(), 10, &[(Kind::Match, 10)], 60)),
            Err(io::Error::other("truncated")),
            Ok(mapped("b", r1_flags(), 10, &[(Kind::Match, 10)], 60)),
        ];
        let out: Vec<_> = MateInfoIter::new(records.into_iter()).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }

    #[test]
    fn test_cigar_string() {
        let cigar: Cigar = vec![
            Op::new(Kind::HardClip, 3),
            Op::new(Kind::Match, 10),
            Op::new(Kind::Deletion, 1),
            Op::new(Kind::SequenceMatch, 4),
        ]
        .into();
        assert_eq!(cigar_string(&cigar), "3H10M1D4=");
        assert_eq!(cigar_string(&Cigar::default()), "*");
    }
}
