use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use flate2::read::MultiGzDecoder;
use crate::config::defs::{FASTA_EXTS, FASTQ_EXTS, GZIP_EXT};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Plain or gzip-decoding file reader; concatenated gzip members are read through.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub fn open_reader(path: &Path) -> io::Result<FileReader> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        Ok(FileReader::Gzipped(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(FileReader::Uncompressed(BufReader::new(file)))
    }
}


/// Splits known sequence and compression extensions off a path.
///
/// # Arguments
///
/// * `path` - File path, e.g. `reads/S1_R1.fastq.gz`.
///
/// # Returns
/// (path without the known extensions, extensions in file order), e.g. (`reads/S1_R1`, [fastq, gz]).
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    let mut stem = path.to_path_buf();
    let mut extensions = Vec::new();
    while let Some(ext) = stem.extension().and_then(|e| e.to_str()).map(str::to_string) {
        let known = ext.eq_ignore_ascii_case(GZIP_EXT)
            || FASTA_EXTS.iter().any(|e| e.eq_ignore_ascii_case(&ext))
            || FASTQ_EXTS.iter().any(|e| e.eq_ignore_ascii_case(&ext));
        if !known {
            break;
        }
        stem.set_extension("");
        extensions.insert(0, ext);
    }
    (stem, extensions)
}

/// Absolute form of `path`, resolved against `cwd` when relative.
pub fn absolute_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// True when the file exists and has a length greater than zero.
pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}
