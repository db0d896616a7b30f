use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder};

/// Writes a gzip compressed tar of the directory's contents to `writer` and
/// returns the writer once the archive is finished.
pub fn build_tar_gzip<W: Write>(source: &Path, writer: W) -> io::Result<W> {
    let enc = GzEncoder::new(writer, Compression::default());
    let mut tar = Builder::new(enc);
    tar.append_dir_all(".", source)?;
    let enc = tar.into_inner()?;
    enc.finish()
}

/// Extracts a gzip compressed tar into `target`, creating it if needed.
/// Entries escaping the target directory are skipped by `tar`.
pub fn extract_tar_gzip<R: Read>(reader: R, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    let decoder = GzDecoder::new(reader);
    let mut archive = Archive::new(decoder);
    archive.unpack(target)
}

/// A missing directory counts as empty.
pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_archive_preserves_nested_files() {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("terraform/.state")).unwrap();
        fs::write(source.path().join("terraform/.state/tf.json"), b"{\"serial\": 4}").unwrap();
        fs::write(source.path().join("version"), b"3").unwrap();

        let archive = build_tar_gzip(source.path(), Vec::new()).unwrap();

        let target = tempfile::tempdir().unwrap();
        let restored = target.path().join("state");
        extract_tar_gzip(archive.as_slice(), &restored).unwrap();

        assert_eq!(
            fs::read_to_string(restored.join("terraform/.state/tf.json")).unwrap(),
            "{\"serial\": 4}"
        );
        assert_eq!(fs::read_to_string(restored.join("version")).unwrap(), "3");
    }

    #[test]
    fn test_is_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_empty_dir(dir.path()).unwrap());
        assert!(is_empty_dir(&dir.path().join("missing")).unwrap());

        fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(!is_empty_dir(dir.path()).unwrap());
    }
}
