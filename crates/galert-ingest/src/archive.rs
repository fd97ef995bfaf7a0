//! Streaming reader for occurrence dumps: a Darwin Core Archive zip holding
//! `occurrence.txt`, or that tab-separated file on its own.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use zip::ZipArchive;

pub const OCCURRENCE_MEMBER: &str = "occurrence.txt";

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("opening archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading archive: {0}")]
    Io(#[from] io::Error),
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive has no {0} member")]
    MissingMember(String),
    #[error("archive has no header row")]
    MissingHeader,
    #[error("loader stopped consuming rows")]
    ReceiverClosed,
}

/// Column name → position, resolved from each archive's own header.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn from_header(line: &str) -> Self {
        let positions = split_fields(line)
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect();
        Self { positions }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }

    /// Value of `column` in `fields`, or `""` when the column is absent from
    /// the header or the row is short.
    pub fn get<'a>(&self, fields: &[&'a str], column: &str) -> &'a str {
        self.positions
            .get(column)
            .and_then(|&idx| fields.get(idx).copied())
            .unwrap_or("")
    }
}

pub fn split_fields(line: &str) -> impl Iterator<Item = &str> {
    line.trim_end_matches(['\n', '\r']).split('\t')
}

/// Counts and hashes every byte pulled through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub data_rows: u64,
    pub content_sha256: String,
    pub bytes_read: u64,
}

/// Streams `path`, calling `on_header` once and `on_row` for every non-blank
/// data line. Blocking: run it off the async runtime.
pub fn stream_archive<H, F>(
    path: &Path,
    on_header: H,
    on_row: F,
) -> Result<StreamStats, ArchiveError>
where
    H: FnOnce(&ColumnIndex) -> Result<(), ArchiveError>,
    F: FnMut(&ColumnIndex, &str) -> Result<(), ArchiveError>,
{
    let mut file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    if is_zip(&mut file)? {
        let mut archive = ZipArchive::new(file)?;
        let member = match archive.by_name(OCCURRENCE_MEMBER) {
            Ok(member) => member,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ArchiveError::MissingMember(OCCURRENCE_MEMBER.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        stream_table(member, on_header, on_row)
    } else {
        stream_table(file, on_header, on_row)
    }
}

fn is_zip(file: &mut File) -> Result<bool, ArchiveError> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(filled == magic.len() && magic == ZIP_MAGIC)
}

fn stream_table<R, H, F>(
    source: R,
    on_header: H,
    mut on_row: F,
) -> Result<StreamStats, ArchiveError>
where
    R: Read,
    H: FnOnce(&ColumnIndex) -> Result<(), ArchiveError>,
    F: FnMut(&ColumnIndex, &str) -> Result<(), ArchiveError>,
{
    let mut reader = BufReader::with_capacity(1 << 20, HashingReader::new(source));
    let mut buf = Vec::with_capacity(4096);

    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Err(ArchiveError::MissingHeader);
    }
    let header = String::from_utf8_lossy(&buf);
    let header = header.trim_start_matches('\u{feff}');
    if header.trim().is_empty() {
        return Err(ArchiveError::MissingHeader);
    }
    let columns = ColumnIndex::from_header(header);
    on_header(&columns)?;

    let mut data_rows = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        data_rows += 1;
        on_row(&columns, &line)?;
    }

    let (content_sha256, bytes_read) = reader.into_inner().finish();
    Ok(StreamStats {
        data_rows,
        content_sha256,
        bytes_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn collect(path: &Path) -> Result<(Vec<String>, StreamStats), ArchiveError> {
        let mut rows = Vec::new();
        let stats = stream_archive(
            path,
            |_| Ok(()),
            |columns, line| {
                let fields: Vec<&str> = split_fields(line).collect();
                rows.push(columns.get(&fields, "occurrenceID").to_string());
                Ok(())
            },
        )?;
        Ok((rows, stats))
    }

    #[test]
    fn header_tolerates_column_reordering() {
        let a = ColumnIndex::from_header("gbifID\toccurrenceID\tspeciesKey");
        let b = ColumnIndex::from_header("speciesKey\tgbifID\toccurrenceID\r\n");
        assert_eq!(a.get(&["1", "occ-1", "42"], "speciesKey"), "42");
        assert_eq!(b.get(&["42", "1", "occ-1"], "speciesKey"), "42");
        assert_eq!(b.get(&["42", "1", "occ-1"], "occurrenceID"), "occ-1");
    }

    #[test]
    fn missing_column_or_short_row_reads_empty() {
        let columns = ColumnIndex::from_header("gbifID\toccurrenceID\tspeciesKey");
        assert_eq!(columns.get(&["1"], "speciesKey"), "");
        assert_eq!(columns.get(&["1", "occ", "2"], "datasetKey"), "");
        assert!(!columns.contains("datasetKey"));
    }

    #[test]
    fn reads_plain_tab_separated_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "gbifID\toccurrenceID\n1\tocc-1\n\n2\tocc-2\r\n").unwrap();
        let (rows, stats) = collect(file.path()).unwrap();
        assert_eq!(rows, vec!["occ-1", "occ-2"]);
        assert_eq!(stats.data_rows, 2);
        assert_eq!(stats.content_sha256.len(), 64);
    }

    #[test]
    fn reads_occurrence_member_of_zip() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut zip = zip::ZipWriter::new(file.reopen().unwrap());
            zip.start_file("meta.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<archive/>").unwrap();
            zip.start_file(OCCURRENCE_MEMBER, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"occurrenceID\tgbifID\nocc-9\t9\n").unwrap();
            zip.finish().unwrap();
        }
        let (rows, stats) = collect(file.path()).unwrap();
        assert_eq!(rows, vec!["occ-9"]);
        assert_eq!(stats.bytes_read, "occurrenceID\tgbifID\nocc-9\t9\n".len() as u64);
    }

    #[test]
    fn zip_without_occurrence_member_is_fatal() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut zip = zip::ZipWriter::new(file.reopen().unwrap());
            zip.start_file("other.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        assert!(matches!(
            collect(file.path()),
            Err(ArchiveError::MissingMember(_))
        ));
    }

    #[test]
    fn empty_file_has_no_header() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(collect(file.path()), Err(ArchiveError::MissingHeader)));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = collect(Path::new("/nonexistent/dump.zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }

    #[test]
    fn hashing_reader_matches_known_digest() {
        let mut reader = HashingReader::new(&b"hello world"[..]);
        io::copy(&mut reader, &mut io::sink()).unwrap();
        let (hash, bytes) = reader.finish();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(bytes, 11);
    }
}
