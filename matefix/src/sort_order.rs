use std::cmp::Ordering;
use std::str::FromStr;

use bstr::{BString, ByteSlice};
use noodles::sam::alignment::RecordBuf;
use noodles::sam::header::record::value::{
    map::{self, header::tag},
    Map,
};
use noodles::sam::Header;

/// Sort order declared in the `SO` field of the `@HD` header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Unknown,
    Unsorted,
    QueryName,
    Coordinate,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Unknown => "unknown",
            SortOrder::Unsorted => "unsorted",
            SortOrder::QueryName => "queryname",
            SortOrder::Coordinate => "coordinate",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(SortOrder::Unknown),
            "unsorted" => Ok(SortOrder::Unsorted),
            "queryname" => Ok(SortOrder::QueryName),
            "coordinate" => Ok(SortOrder::Coordinate),
            _ => Err(format!("unsupported sort order: {}", s)),
        }
    }
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The sort order declared by the header, if any.
pub fn sort_order(header: &Header) -> Option<SortOrder> {
    header
        .header()
        .and_then(|hd| hd.other_fields().get(&tag::SORT_ORDER))
        .and_then(|so| so.to_str().ok())
        .and_then(|so| so.parse().ok())
}

/// Return a copy of `header` declaring `order`. A missing `@HD` line is created.
pub fn with_sort_order(header: &Header, order: SortOrder) -> Header {
    let mut header = header.clone();
    header
        .header_mut()
        .get_or_insert_with(Map::<map::Header>::default)
        .other_fields_mut()
        .insert(tag::SORT_ORDER, BString::from(order.as_str()));
    header
}

/// Byte-order comparison of query names. Records sharing a name are ordered
/// first segment, then last segment, then secondary/supplementary alignments.
pub fn query_name_cmp(a: &RecordBuf, b: &RecordBuf) -> Ordering {
    a.name()
        .cmp(&b.name())
        .then_with(|| segment_rank(a).cmp(&segment_rank(b)))
}

fn segment_rank(record: &RecordBuf) -> (bool, u8) {
    let flags = record.flags();
    let segment = if flags.is_first_segment() {
        0
    } else if flags.is_last_segment() {
        1
    } else {
        2
    };
    (flags.is_secondary() || flags.is_supplementary(), segment)
}

/// Coordinate order: reference index (unplaced records last), alignment
/// start, strand, then query name.
pub fn coordinate_cmp(a: &RecordBuf, b: &RecordBuf) -> Ordering {
    fn key(record: &RecordBuf) -> (usize, usize) {
        (
            record.reference_sequence_id().unwrap_or(usize::MAX),
            record.alignment_start().map_or(usize::MAX, |pos| pos.get()),
        )
    }

    key(a)
        .cmp(&key(b))
        .then_with(|| {
            a.flags()
                .is_reverse_complemented()
                .cmp(&b.flags().is_reverse_complemented())
        })
        .then_with(|| query_name_cmp(a, b))
}
