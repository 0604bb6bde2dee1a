//! Extraction of the single CSV file inside a survey export archive.

use std::io::{Cursor, Read};

use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::AppError;

/// UTF-8 BOM as it appears at the start of decoded text.
const UTF8_BOM: char = '\u{FEFF}';

/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_PREALLOC: usize = 8 * 1024 * 1024;

/// Pure decoder from archive bytes to CSV text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveDecoder;

impl ArchiveDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Returns the contents of the first file entry as UTF-8 text.
    ///
    /// Directory entries are skipped. Extra file entries are ignored with a
    /// warning. A leading BOM is removed.
    ///
    /// # Errors
    ///
    /// `AppError::MalformedArchive` when the bytes are not a ZIP archive, the
    /// archive holds no file, or the file is not valid UTF-8.
    pub fn extract_csv(&self, bytes: &[u8]) -> Result<String, AppError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| AppError::MalformedArchive(format!("not a readable ZIP: {}", e)))?;

        let mut file_indices = Vec::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|e| AppError::MalformedArchive(format!("unreadable entry: {}", e)))?;
            if !entry.is_dir() {
                file_indices.push(index);
            }
        }

        let Some(&first) = file_indices.first() else {
            return Err(AppError::MalformedArchive(
                "archive contains no file entries".into(),
            ));
        };

        if file_indices.len() > 1 {
            warn!(
                "[ARCHIVE] Archive holds {} files, using the first one only",
                file_indices.len()
            );
        }

        let mut entry = archive
            .by_index(first)
            .map_err(|e| AppError::MalformedArchive(format!("unreadable entry: {}", e)))?;
        let name = entry.name().to_string();

        // The declared size is read from the archive and may be forged.
        let declared = usize::try_from(entry.size()).unwrap_or(usize::MAX);
        let mut raw = Vec::with_capacity(declared.min(MAX_PREALLOC));
        entry
            .read_to_end(&mut raw)
            .map_err(|e| AppError::MalformedArchive(format!("cannot inflate '{}': {}", name, e)))?;

        let text = String::from_utf8(raw)
            .map_err(|_| AppError::MalformedArchive(format!("'{}' is not valid UTF-8", name)))?;

        info!("[ARCHIVE] Extracted '{}' ({} bytes)", name, text.len());

        Ok(match text.strip_prefix(UTF8_BOM) {
            Some(rest) => rest.to_string(),
            None => text,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::zip_with;
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    #[test]
    fn extracts_single_csv() {
        let bytes = zip_with("responses.csv", b"Number,User\n1,alice\n");
        let text = ArchiveDecoder::new().extract_csv(&bytes).unwrap();
        assert_eq!(text, "Number,User\n1,alice\n");
    }

    #[test]
    fn strips_utf8_bom() {
        let bytes = zip_with("responses.csv", b"\xEF\xBB\xBFA,B\n1,2\n");
        let text = ArchiveDecoder::new().extract_csv(&bytes).unwrap();
        assert_eq!(text, "A,B\n1,2\n");
    }

    #[test]
    fn empty_archive_is_malformed() {
        let writer = ZipWriter::new(Cursor::new(Vec::new()));
        let bytes = writer.finish().unwrap().into_inner();
        let result = ArchiveDecoder::new().extract_csv(&bytes);
        assert!(matches!(result, Err(AppError::MalformedArchive(_))));
    }

    #[test]
    fn directory_only_archive_is_malformed() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_directory("exports/", SimpleFileOptions::default())
            .unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let result = ArchiveDecoder::new().extract_csv(&bytes);
        assert!(matches!(result, Err(AppError::MalformedArchive(_))));
    }

    #[test]
    fn skips_directories_and_takes_first_file() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_directory("exports/", SimpleFileOptions::default())
            .unwrap();
        writer
            .start_file("exports/first.csv", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"A\nfirst\n").unwrap();
        writer
            .start_file("exports/second.csv", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"A\nsecond\n").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let text = ArchiveDecoder::new().extract_csv(&bytes).unwrap();
        assert_eq!(text, "A\nfirst\n");
    }

    #[test]
    fn non_zip_bytes_are_malformed() {
        let result = ArchiveDecoder::new().extract_csv(b"<html>not a zip</html>");
        assert!(matches!(result, Err(AppError::MalformedArchive(_))));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let bytes = zip_with("responses.csv", b"A\n\xff\xfe\n");
        let result = ArchiveDecoder::new().extract_csv(&bytes);
        assert!(matches!(result, Err(AppError::MalformedArchive(_))));
    }

    fn u16_at(bytes: &[u8], at: usize) -> usize {
        u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize
    }

    /// Rewrites the ZIP64 uncompressed size of the first central directory
    /// entry.
    fn forge_zip64_size(bytes: &mut [u8], size: u64) {
        let header = bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .expect("central directory header");
        let name_len = u16_at(bytes, header + 28);
        let extra_len = u16_at(bytes, header + 30);
        bytes[header + 24..header + 28].copy_from_slice(&u32::MAX.to_le_bytes());

        let mut at = header + 46 + name_len;
        let end = at + extra_len;
        while at + 4 <= end {
            let id = u16_at(bytes, at);
            let len = u16_at(bytes, at + 2);
            if id == 0x0001 {
                assert!(len >= 8);
                bytes[at + 4..at + 12].copy_from_slice(&size.to_le_bytes());
                return;
            }
            at += 4 + len;
        }
        panic!("no ZIP64 extra field in central directory");
    }

    #[test]
    fn forged_entry_size_does_not_abort() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(
                "responses.csv",
                SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Stored)
                    .large_file(true),
            )
            .unwrap();
        writer.write_all(b"A\n1\n").unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();
        forge_zip64_size(&mut bytes, 1 << 62);

        match ArchiveDecoder::new().extract_csv(&bytes) {
            Ok(text) => assert_eq!(text, "A\n1\n"),
            Err(e) => assert!(matches!(e, AppError::MalformedArchive(_)), "{:?}", e),
        }
    }

    #[test]
    fn keeps_non_ascii_content() {
        let bytes = zip_with("r.csv", "Ville\nMontréal\n".as_bytes());
        let text = ArchiveDecoder::new().extract_csv(&bytes).unwrap();
        assert_eq!(text, "Ville\nMontréal\n");
    }
}
