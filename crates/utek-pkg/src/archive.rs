//! In-memory tar handling for UNPACK.
//!
//! Archives live inside an execution unit's virtual filesystem, so entries
//! are read into memory rather than extracted to host paths. Entry paths
//! are validated before they can name anything outside the unpack target.

use std::io::Read as _;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Read a tar archive into `(relative path, content)` pairs. Directory
/// entries are dropped (directories materialize when files are written).
pub fn unpack_tar_entries(archive_bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
    let mut out = Vec::new();
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let path = entry.path().context("read tar entry path")?.into_owned();
        validate_archive_rel_path(&path)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            anyhow::bail!("unsupported tar entry type for {:?}", path);
        }
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .context("read tar entry bytes")?;
        let rel = path
            .to_str()
            .with_context(|| format!("non-utf8 archive path: {path:?}"))?
            .to_string();
        out.push((rel, buf));
    }
    Ok(out)
}

/// Deterministic tar of `(relative path, content)` pairs, sorted by path.
pub fn build_tar_bytes(entries: &[(PathBuf, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut normalized: Vec<(PathBuf, Vec<u8>)> = entries.to_vec();
    normalized.sort_by(|(a, _), (b, _)| {
        a.as_os_str()
            .as_encoded_bytes()
            .cmp(b.as_os_str().as_encoded_bytes())
    });

    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        builder.mode(tar::HeaderMode::Deterministic);
        for (path, bytes) in &normalized {
            validate_archive_rel_path(path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder
                .append_data(&mut header, path, std::io::Cursor::new(bytes))
                .with_context(|| format!("append tar entry: {}", path.display()))?;
        }
        builder.finish().context("finish tar")?;
    }
    Ok(buf)
}

fn validate_archive_rel_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("empty archive path");
    }
    if path.is_absolute() {
        anyhow::bail!("absolute archive paths are not allowed: {:?}", path);
    }
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                anyhow::bail!("windows prefix archive paths are not allowed: {:?}", path);
            }
            Component::ParentDir => {
                anyhow::bail!("archive paths must not contain '..': {:?}", path);
            }
            Component::CurDir => {
                anyhow::bail!("archive paths must not contain '.': {:?}", path);
            }
            Component::RootDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_round_trip() {
        let entries = vec![
            (PathBuf::from("b/nested.txt"), b"nested".to_vec()),
            (PathBuf::from("a.txt"), b"top".to_vec()),
        ];
        let bytes = build_tar_bytes(&entries).unwrap();
        let unpacked = unpack_tar_entries(&bytes).unwrap();
        // Deterministic build sorts by path.
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0], ("a.txt".to_string(), b"top".to_vec()));
        assert_eq!(unpacked[1], ("b/nested.txt".to_string(), b"nested".to_vec()));
    }

    #[test]
    fn build_is_deterministic() {
        let entries = vec![
            (PathBuf::from("x"), b"1".to_vec()),
            (PathBuf::from("y"), b"2".to_vec()),
        ];
        assert_eq!(
            build_tar_bytes(&entries).unwrap(),
            build_tar_bytes(&entries).unwrap()
        );
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let entries = vec![(PathBuf::from("../escape"), b"x".to_vec())];
        assert!(build_tar_bytes(&entries).is_err());
        let entries = vec![(PathBuf::from("/abs"), b"x".to_vec())];
        assert!(build_tar_bytes(&entries).is_err());
    }
}
