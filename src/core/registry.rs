use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::models::{ArchiveError, Result};

/// Bytes read from the start of a file for signature matching; covers the
/// `ustar` magic at offset 257.
pub const SNIFF_LEN: usize = 512;

/// Outer compression of a TAR stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

/// Identifies a supported archive format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FormatId {
    Zip,
    SevenZ,
    Rar,
    Tar(TarCompression),
}

impl FormatId {
    pub fn name(self) -> &'static str {
        match self {
            FormatId::Zip => "ZIP",
            FormatId::SevenZ => "7Z",
            FormatId::Rar => "RAR",
            FormatId::Tar(TarCompression::None) => "TAR",
            FormatId::Tar(TarCompression::Gzip) => "TAR.GZ",
            FormatId::Tar(TarCompression::Bzip2) => "TAR.BZ2",
            FormatId::Tar(TarCompression::Xz) => "TAR.XZ",
            FormatId::Tar(TarCompression::Zstd) => "TAR.ZST",
        }
    }

    /// Pick the format of a new archive from its file name
    pub fn from_output_path(path: &Path) -> Result<FormatId> {
        format_from_name(path).ok_or_else(|| {
            ArchiveError::UnsupportedFormat(format!(
                "Cannot tell archive format from name: {}",
                path.display()
            ))
        })
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a format was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Confidence {
    /// Magic bytes matched
    Signature,
    /// No magic matched; the file name suggested the format
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub format: FormatId,
    pub confidence: Confidence,
}

/// What a format's adapter can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_write: bool,
    pub can_password: bool,
    pub can_multi_volume: bool,
}

pub fn capabilities_of(format: FormatId) -> Capabilities {
    match format {
        FormatId::Zip | FormatId::SevenZ => Capabilities {
            can_write: true,
            can_password: true,
            can_multi_volume: false,
        },
        FormatId::Rar => Capabilities {
            can_write: false,
            can_password: true,
            can_multi_volume: true,
        },
        FormatId::Tar(_) => Capabilities {
            can_write: true,
            can_password: false,
            can_multi_volume: false,
        },
    }
}

/// Match magic bytes at the start of a file
fn format_from_signature(data: &[u8]) -> Option<FormatId> {
    match data {
        [0x50, 0x4B, 0x03, 0x04, ..]
        | [0x50, 0x4B, 0x05, 0x06, ..]
        | [0x50, 0x4B, 0x07, 0x08, ..] => Some(FormatId::Zip),
        [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, ..] => Some(FormatId::SevenZ),
        // RAR5 is `Rar!\x1A\x07\x01\x00`, RAR4 `Rar!\x1A\x07\x00`
        [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00, ..]
        | [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00, ..] => Some(FormatId::Rar),
        [0x1F, 0x8B, ..] => Some(FormatId::Tar(TarCompression::Gzip)),
        [0x42, 0x5A, 0x68, ..] => Some(FormatId::Tar(TarCompression::Bzip2)),
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Some(FormatId::Tar(TarCompression::Xz)),
        [0x28, 0xB5, 0x2F, 0xFD, ..] => Some(FormatId::Tar(TarCompression::Zstd)),
        _ if is_tar_header(data) => Some(FormatId::Tar(TarCompression::None)),
        _ => None,
    }
}

fn is_tar_header(data: &[u8]) -> bool {
    // POSIX "ustar\0" and old GNU "ustar " both start with these five bytes
    data.len() >= 262 && &data[257..262] == b"ustar"
}

fn format_from_name(path: &Path) -> Option<FormatId> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    let ext = |suffix: &str| name.ends_with(suffix);

    if ext(".tar.gz") || ext(".tgz") {
        Some(FormatId::Tar(TarCompression::Gzip))
    } else if ext(".tar.bz2") || ext(".tbz2") || ext(".tbz") {
        Some(FormatId::Tar(TarCompression::Bzip2))
    } else if ext(".tar.xz") || ext(".txz") {
        Some(FormatId::Tar(TarCompression::Xz))
    } else if ext(".tar.zst") || ext(".tzst") {
        Some(FormatId::Tar(TarCompression::Zstd))
    } else if ext(".tar") {
        Some(FormatId::Tar(TarCompression::None))
    } else if ext(".zip") || ext(".jar") {
        Some(FormatId::Zip)
    } else if ext(".7z") {
        Some(FormatId::SevenZ)
    } else if ext(".rar") || is_rar_volume_name(&name) {
        Some(FormatId::Rar)
    } else {
        None
    }
}

/// Old-style continuation volumes: `.r00` .. `.r99`
fn is_rar_volume_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => {
            ext.len() == 3 && ext.starts_with('r') && ext[1..].bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// True when a RAR file name marks it as part of a multi-volume set
pub fn is_multi_volume_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    if is_rar_volume_name(&name) {
        return true;
    }
    // `name.partN.rar`
    name.strip_suffix(".rar")
        .and_then(|stem| stem.rsplit_once(".part"))
        .map(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Detect a format from the leading bytes of a file, falling back to the file name
///
/// # Arguments
/// * `header` - Leading bytes; only the first [`SNIFF_LEN`] are looked at
/// * `name_hint` - File name used when no signature matches
pub fn detect_bytes(header: &[u8], name_hint: Option<&Path>) -> Result<Detection> {
    let header = &header[..header.len().min(SNIFF_LEN)];
    if let Some(format) = format_from_signature(header) {
        return Ok(Detection {
            format,
            confidence: Confidence::Signature,
        });
    }
    if let Some(format) = name_hint.and_then(format_from_name) {
        return Ok(Detection {
            format,
            confidence: Confidence::Extension,
        });
    }
    Err(ArchiveError::UnsupportedFormat(match name_hint {
        Some(p) => p.display().to_string(),
        None => "unrecognized signature".to_string(),
    }))
}

/// Detect the format of a file on disk, reading at most [`SNIFF_LEN`] bytes
pub fn detect_path(path: &Path) -> Result<Detection> {
    let file = File::open(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| ArchiveError::from_io(e, path.display()))?;
    let detection = detect_bytes(&header, Some(path))?;
    log::debug!(
        "Detected {} ({:?}) for {}",
        detection.format,
        detection.confidence,
        path.display()
    );
    Ok(detection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sig(bytes: &[u8]) -> FormatId {
        detect_bytes(bytes, None).unwrap().format
    }

    #[test]
    fn test_detect_signatures() {
        assert_eq!(sig(&[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00]), FormatId::Zip);
        assert_eq!(sig(&[0x50, 0x4B, 0x05, 0x06, 0x00, 0x00]), FormatId::Zip);
        assert_eq!(sig(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00]), FormatId::SevenZ);
        assert_eq!(sig(b"Rar!\x1A\x07\x00\xCF"), FormatId::Rar);
        assert_eq!(sig(b"Rar!\x1A\x07\x01\x00"), FormatId::Rar);
        assert_eq!(sig(&[0x1F, 0x8B, 0x08]), FormatId::Tar(TarCompression::Gzip));
        assert_eq!(sig(b"BZh91AY"), FormatId::Tar(TarCompression::Bzip2));
        assert_eq!(
            sig(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00]),
            FormatId::Tar(TarCompression::Xz)
        );
        assert_eq!(sig(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]), FormatId::Tar(TarCompression::Zstd));
    }

    #[test]
    fn test_detect_plain_tar() {
        let mut header = [0u8; 512];
        header[257..263].copy_from_slice(b"ustar\0");
        let detection = detect_bytes(&header, None).unwrap();
        assert_eq!(detection.format, FormatId::Tar(TarCompression::None));
        assert_eq!(detection.confidence, Confidence::Signature);
    }

    #[test]
    fn test_signature_beats_extension() {
        let detection =
            detect_bytes(&[0x50, 0x4B, 0x03, 0x04], Some(Path::new("misnamed.7z"))).unwrap();
        assert_eq!(detection.format, FormatId::Zip);
        assert_eq!(detection.confidence, Confidence::Signature);
    }

    #[test]
    fn test_extension_fallback() {
        let detection = detect_bytes(&[0u8; 16], Some(Path::new("Backup.TAR.ZST"))).unwrap();
        assert_eq!(detection.format, FormatId::Tar(TarCompression::Zstd));
        assert_eq!(detection.confidence, Confidence::Extension);
    }

    #[test]
    fn test_unknown_format() {
        let err = detect_bytes(&[0xDE, 0xAD, 0xBE, 0xEF], Some(Path::new("notes.txt")))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_truncated_tar_header_is_not_tar() {
        assert!(detect_bytes(&[0u8; 256], None).is_err());
    }

    #[test]
    fn test_output_path_format() {
        assert_eq!(
            FormatId::from_output_path(&PathBuf::from("out/a.tgz")).unwrap(),
            FormatId::Tar(TarCompression::Gzip)
        );
        assert_eq!(
            FormatId::from_output_path(&PathBuf::from("a.7z")).unwrap(),
            FormatId::SevenZ
        );
        assert!(FormatId::from_output_path(&PathBuf::from("a.docx")).is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(!capabilities_of(FormatId::Rar).can_write);
        assert!(capabilities_of(FormatId::Rar).can_multi_volume);
        assert!(capabilities_of(FormatId::SevenZ).can_password);
        assert!(!capabilities_of(FormatId::Tar(TarCompression::Gzip)).can_password);
    }

    #[test]
    fn test_multi_volume_names() {
        assert!(is_multi_volume_name(Path::new("movie.part1.rar")));
        assert!(is_multi_volume_name(Path::new("movie.part12.rar")));
        assert!(is_multi_volume_name(Path::new("movie.r00")));
        assert!(!is_multi_volume_name(Path::new("movie.rar")));
        assert!(!is_multi_volume_name(Path::new("party.rar")));
    }

    #[test]
    fn test_detect_path_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04]).unwrap();
        assert_eq!(detect_path(&path).unwrap().format, FormatId::SevenZ);
    }
}
