//! Post-processing of SAM/BAM alignment streams.
//!
//! The pipeline restores original base qualities (the `OQ` field), repairs
//! alignments that run past the end of their reference sequence and adds the
//! mate CIGAR (`MC`) to every mapped, paired record. Mates are brought
//! together with a bounded-memory external sort by query name.

pub mod extsort;
pub mod io;
pub mod mate;
pub mod normalize;
pub mod pipeline;
pub mod skip;
pub mod sort_order;

pub use pipeline::{run, Outcome, RevertOptions, RevertStats};
pub use skip::CanSkip;
pub use sort_order::SortOrder;
