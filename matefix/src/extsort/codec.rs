//! Encodings for sorted runs spilled to disk.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use bincode::{Decode, Encode};
use noodles::bam;
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::Header;

/// Creates the writer and reader of a single spill run.
pub trait RunCodec {
    type Item;
    type Writer: RunWriter<Item = Self::Item>;
    type Reader: RunReader<Item = Self::Item>;

    fn writer(&self, file: File) -> io::Result<Self::Writer>;

    fn reader(&self, file: File) -> io::Result<Self::Reader>;
}

pub trait RunWriter {
    type Item;

    fn write_item(&mut self, item: &Self::Item) -> io::Result<()>;

    /// Flush everything to the underlying file.
    fn finish(self) -> io::Result<()>;
}

pub trait RunReader {
    type Item;

    /// `Ok(None)` at the end of the run.
    fn read_item(&mut self) -> io::Result<Option<Self::Item>>;
}

/// Spills alignment records as uncompressed BAM records (no BAM header, no
/// BGZF framing).
#[derive(Clone)]
pub struct BamCodec {
    header: Arc<Header>,
}

impl BamCodec {
    pub fn new(header: Arc<Header>) -> Self {
        Self { header }
    }
}

impl RunCodec for BamCodec {
    type Item = RecordBuf;
    type Writer = BamRunWriter;
    type Reader = BamRunReader;

    fn writer(&self, file: File) -> io::Result<Self::Writer> {
        Ok(BamRunWriter {
            inner: bam::io::Writer::from(BufWriter::new(file)),
            header: self.header.clone(),
        })
    }

    fn reader(&self, file: File) -> io::Result<Self::Reader> {
        Ok(BamRunReader {
            inner: bam::io::Reader::from(BufReader::new(file)),
            header: self.header.clone(),
        })
    }
}

pub struct BamRunWriter {
    inner: bam::io::Writer<BufWriter<File>>,
    header: Arc<Header>,
}

impl RunWriter for BamRunWriter {
    type Item = RecordBuf;

    fn write_item(&mut self, item: &RecordBuf) -> io::Result<()> {
        self.inner.write_alignment_record(&self.header, item)
    }

    fn finish(mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

pub struct BamRunReader {
    inner: bam::io::Reader<BufReader<File>>,
    header: Arc<Header>,
}

impl RunReader for BamRunReader {
    type Item = RecordBuf;

    fn read_item(&mut self) -> io::Result<Option<RecordBuf>> {
        let mut record = RecordBuf::default();
        match self.inner.read_record_buf(&self.header, &mut record)? {
            0 => Ok(None),
            _ => Ok(Some(record)),
        }
    }
}

/// Generic codec for items that are not alignment records, such as sort
/// keys or per-record summaries. Any `bincode`-encodable value can be
/// spilled with it; alignment records go through [`BamCodec`].
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Encode + Decode<()>> RunCodec for BincodeCodec<T> {
    type Item = T;
    type Writer = BincodeRunWriter<T>;
    type Reader = BincodeRunReader<T>;

    fn writer(&self, file: File) -> io::Result<Self::Writer> {
        Ok(BincodeRunWriter {
            inner: BufWriter::new(file),
            _marker: PhantomData,
        })
    }

    fn reader(&self, file: File) -> io::Result<Self::Reader> {
        Ok(BincodeRunReader {
            inner: BufReader::new(file),
            _marker: PhantomData,
        })
    }
}

pub struct BincodeRunWriter<T> {
    inner: BufWriter<File>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Encode> RunWriter for BincodeRunWriter<T> {
    type Item = T;

    fn write_item(&mut self, item: &T) -> io::Result<()> {
        bincode::encode_into_std_write(item, &mut self.inner, bincode::config::standard())
            .map(|_| ())
            .map_err(io::Error::other)
    }

    fn finish(mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct BincodeRunReader<T> {
    inner: BufReader<File>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Decode<()>> RunReader for BincodeRunReader<T> {
    type Item = T;

    fn read_item(&mut self) -> io::Result<Option<T>> {
        if self.inner.fill_buf()?.is_empty() {
            return Ok(None);
        }
        bincode::decode_from_std_read(&mut self.inner, bincode::config::standard())
            .map(Some)
            .map_err(io::Error::other)
    }
}
