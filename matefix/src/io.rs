use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use md5::{Digest, Md5};
use noodles::sam::alignment::RecordBuf;
use noodles::{bam, sam};

/// A stream of alignment records in file order.
pub type Records = Box<dyn Iterator<Item = io::Result<RecordBuf>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Sam,
    Bam,
}

impl Format {
    /// SAM for a `.sam` extension, BAM otherwise.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension() {
            Some(ext) if ext.eq_ignore_ascii_case("sam") => Format::Sam,
            _ => Format::Bam,
        }
    }
}

/// Open a SAM or BAM file and read its header. The returned records start at
/// the first alignment, so each call yields an independent pass over the file.
pub fn open_alignments<P: AsRef<Path>>(path: P) -> Result<(sam::Header, Records)> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open file: {}", path.display()))?;
    match Format::from_path(path) {
        Format::Bam => {
            let mut reader = bam::io::Reader::new(file);
            let header = reader
                .read_header()
                .with_context(|| format!("cannot read BAM header: {}", path.display()))?;
            let records = BamRecords { reader, header: header.clone() };
            Ok((header, Box::new(records)))
        }
        Format::Sam => {
            let mut reader = sam::io::Reader::new(BufReader::new(file));
            let header = reader
                .read_header()
                .with_context(|| format!("cannot read SAM header: {}", path.display()))?;
            let records = SamRecords { reader, header: header.clone() };
            Ok((header, Box::new(records)))
        }
    }
}

struct BamRecords<R> {
    reader: bam::io::Reader<R>,
    header: sam::Header,
}

impl<R: Read> Iterator for BamRecords<R> {
    type Item = io::Result<RecordBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = RecordBuf::default();
        match self.reader.read_record_buf(&self.header, &mut record) {
            Ok(0) => None,
            Ok(_) => Some(Ok(record)),
            Err(e) => Some(Err(e)),
        }
    }
}

struct SamRecords<R> {
    reader: sam::io::Reader<R>,
    header: sam::Header,
}

impl<R: BufRead> Iterator for SamRecords<R> {
    type Item = io::Result<RecordBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = RecordBuf::default();
        match self.reader.read_record_buf(&self.header, &mut record) {
            Ok(0) => None,
            Ok(_) => Some(Ok(record)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Create a SAM or BAM writer, chosen by the file extension. The caller writes
/// the header and must call `finish` once all records are written.
pub fn create_alignment_writer<P: AsRef<Path>>(
    path: P,
) -> Result<Box<dyn sam::alignment::io::Write>> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("cannot create file: {}", path.display()))?;
    let writer: Box<dyn sam::alignment::io::Write> = match Format::from_path(path) {
        Format::Bam => Box::new(bam::io::Writer::new(file)),
        Format::Sam => Box::new(sam::io::Writer::new(BufWriter::new(file))),
    };
    Ok(writer)
}

/// Fail unless `path` is an existing, readable regular file.
pub fn assert_readable<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    ensure!(path.exists(), "input file does not exist: {}", path.display());
    ensure!(path.is_file(), "input is not a regular file: {}", path.display());
    File::open(path).with_context(|| format!("cannot read input file: {}", path.display()))?;
    Ok(())
}

/// Fail unless `path` can be created or overwritten.
pub fn assert_writable<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        ensure!(!path.is_dir(), "output is a directory: {}", path.display());
        let metadata = path
            .metadata()
            .with_context(|| format!("cannot stat output file: {}", path.display()))?;
        if metadata.permissions().readonly() {
            bail!("output file is not writable: {}", path.display());
        }
    } else {
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        ensure!(
            parent.is_dir(),
            "output directory does not exist: {}",
            parent.display()
        );
        let metadata = parent
            .metadata()
            .with_context(|| format!("cannot stat output directory: {}", parent.display()))?;
        if metadata.permissions().readonly() {
            bail!("output directory is not writable: {}", parent.display());
        }
    }
    Ok(())
}

pub fn md5sum<P: AsRef<Path>>(path: P) -> Result<String> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("cannot open file: {}", path.as_ref().display()))?;
    let mut reader = BufReader::new(file);

    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let digest = hasher.finalize();
    Ok(base16ct::lower::encode_string(&digest))
}

/// Write the MD5 digest of `path` next to it, as `<path>.md5`.
pub fn write_md5_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let digest = md5sum(path)?;
    let mut md5_path = path.as_os_str().to_owned();
    md5_path.push(".md5");
    let mut file = File::create(&md5_path)
        .with_context(|| format!("cannot create file: {:?}", md5_path))?;
    writeln!(file, "{}", digest)?;
    Ok(())
}
