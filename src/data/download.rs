//! Fetch gzipped IDX files into the data directory
//!
//! Each file is decompressed into `{name}.part` and renamed into place once
//! complete, so a reader never sees a truncated file.

use candle_core::Result;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::dataset::{DatasetKind, IDX_FILES};

fn io_err(context: String, e: io::Error) -> candle_core::Error {
    candle_core::Error::Msg(format!("{}: {}", context, e))
}

/// Whether every IDX file of the dataset is present in `dir`
pub fn is_complete(dir: &Path) -> bool {
    IDX_FILES.iter().all(|name| dir.join(name).is_file())
}

/// Download whatever IDX files are missing from `dir`
pub fn download_dataset(kind: DatasetKind, dir: &Path) -> Result<()> {
    if is_complete(dir) {
        log::debug!("{} already in {}", kind, dir.display());
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| io_err(format!("Failed to create {}", dir.display()), e))?;

    for name in IDX_FILES {
        let target = dir.join(name);
        if target.is_file() {
            log::debug!("{} already present", target.display());
            continue;
        }

        let url = format!("{}/{}.gz", kind.mirror(), name);
        log::info!("Downloading {}", url);
        let response = ureq::get(&url)
            .call()
            .map_err(|e| candle_core::Error::Msg(format!("Failed to download {}: {}", url, e)))?;
        let bytes = decompress_into(response.into_reader(), &target)?;
        log::info!("Wrote {} ({} bytes)", target.display(), bytes);
    }

    Ok(())
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Gunzip `reader` into `target`, publishing it with a rename
pub fn decompress_into<R: Read>(reader: R, target: &Path) -> Result<u64> {
    let part = part_path(target);
    let file = File::create(&part).map_err(|e| io_err(format!("Failed to create {}", part.display()), e))?;
    let mut writer = BufWriter::new(file);
    let mut decoder = GzDecoder::new(reader);

    let written = io::copy(&mut decoder, &mut writer)
        .and_then(|n| writer.flush().map(|_| n))
        .map_err(|e| {
            let _ = fs::remove_file(&part);
            io_err(format!("Failed to decompress into {}", part.display()), e)
        })?;

    fs::rename(&part, target).map_err(|e| io_err(format!("Failed to publish {}", target.display()), e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decompress_publishes_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("train-labels-idx1-ubyte");
        let payload = b"\x00\x00\x08\x01labels";

        let written = decompress_into(&gzip(payload)[..], &target).unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(fs::read(&target).unwrap(), payload);
        assert!(!part_path(&target).exists());
    }

    #[test]
    fn test_corrupt_archive_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t10k-images-idx3-ubyte");

        assert!(decompress_into(&b"not gzip"[..], &target).is_err());
        assert!(!target.exists());
        assert!(!part_path(&target).exists());
    }

    #[test]
    fn test_existing_files_are_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        for name in IDX_FILES {
            fs::write(dir.path().join(name), b"cached").unwrap();
        }
        assert!(is_complete(dir.path()));
        // Every file is present, so no request is made.
        download_dataset(DatasetKind::Mnist, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join(IDX_FILES[0])).unwrap(), b"cached");
    }
}
