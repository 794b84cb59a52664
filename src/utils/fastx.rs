use seq_io::fasta::{Reader as FastaReader, OwnedRecord as FastaOwnedRecord};
use seq_io::fastq::Reader as FastqReader;
use std::io::{self, Write};
use std::path::Path;
use crate::config::defs::{FASTA_EXTS, FASTA_TAG, FASTQ_EXTS, FASTQ_TAG};
use crate::utils::file::{extension_remover, open_reader, FileReader};

/// A FASTA record with its header split into id and description.
#[derive(Clone, Debug, PartialEq)]
pub struct FastaRecord {
    pub id: String,
    pub desc: Option<String>,
    pub seq: Vec<u8>,
}

impl From<FastaOwnedRecord> for FastaRecord {
    fn from(record: FastaOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '>');
        FastaRecord {
            id,
            desc,
            seq: record.seq,
        }
    }
}


/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<FileReader>),
    Fastq(FastqReader<FileReader>),
}

/// Creates a SequenceReader for either FASTA or FASTQ files, plain or gzipped.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// io::Result<SequenceReader>: Result bearing the correct SequenceReader.
///
pub fn sequence_reader(path: &Path) -> io::Result<SequenceReader> {
    let filetype = fastx_filetype(path)?;
    let reader = open_reader(path)?;
    match filetype {
        FASTA_TAG => Ok(SequenceReader::Fasta(FastaReader::new(reader))),
        _ => Ok(SequenceReader::Fastq(FastqReader::new(reader))),
    }
}

/// Opens a FASTA file (plain or gzipped) regardless of its extension.
pub fn fasta_reader(path: &Path) -> io::Result<FastaReader<FileReader>> {
    Ok(FastaReader::new(open_reader(path)?))
}


pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    // 80 chars per line
    for chunk in seq.chunks(80) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}


/// Determines if a file path is a FASTA, FASTQ, or neither.
/// Checks extensions, not the body.
///
/// # Arguments
///
/// * `path` - Path of a sequence file.
///
/// # Returns
/// Result<&str>. Ok fastq or fasta, or err.
///
fn fastx_filetype(path: &Path) -> io::Result<&'static str> {
    let (_, extensions) = extension_remover(path);

    for ext in &extensions {
        if FASTA_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTA_TAG);
        }

        if FASTQ_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTQ_TAG);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "File '{}' has invalid extension(s) '{:?}'. Expected FASTA ({:?}) or FASTQ ({:?}).",
            path.display(),
            extensions,
            FASTA_EXTS,
            FASTQ_EXTS
        ),
    ))
}


/// Parses a FASTX header.
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}


/// Counts the number of records in a FASTA or FASTQ file.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// u64: Number of records in the file.
///
pub fn record_counter(path: &Path) -> io::Result<u64> {
    let mut counter = 0;
    match sequence_reader(path)? {
        SequenceReader::Fasta(reader) => {
            for record in reader.into_records() {
                record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                counter += 1;
            }
        }
        SequenceReader::Fastq(reader) => {
            for record in reader.into_records() {
                record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                counter += 1;
            }
        }
    }
    Ok(counter)
}
