//! The tar extractor. Input: a tarball path and a target directory. Regular
//! files, directories and symlinks are realized in one pass; hard links are
//! deferred until every other entry has landed, so a hard link that precedes
//! its target in archive order still resolves.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use tar::{Archive, EntryType};

pub fn untar(tarball: &Path, target: &Path) -> io::Result<()> {
    let file = fs::File::open(tarball)?;
    let mut archive = Archive::new(file);
    untar_from(&mut archive, target)
}

fn untar_from<R: io::Read>(archive: &mut Archive<R>, target: &Path) -> io::Result<()> {
    let mut hard_links: HashMap<PathBuf, PathBuf> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = target.join(entry.path()?.as_ref());
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&path)?;
            }
            EntryType::Link => {
                let link_name = entry
                    .link_name()?
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "hard link entry missing link name"))?;
                hard_links.insert(path, target.join(link_name));
            }
            EntryType::Symlink => {
                let link_name = entry
                    .link_name()?
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "symlink entry missing link name"))?;
                match std::os::unix::fs::symlink(&link_name, &path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
            }
            EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut opts = fs::OpenOptions::new();
                opts.create(true).truncate(true).write(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    opts.mode(mode);
                }
                match opts.open(&path) {
                    Ok(mut out) => {
                        io::copy(&mut entry, &mut out)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
            }
            other => {
                warn!("untar: unhandled entry type {:?} for {:?}, skipping", other, path);
            }
        }
    }

    // Targets must exist before the links that point at them, so hard links
    // are realized last, after the rest of the archive has landed.
    for (new_path, link_target) in hard_links {
        fs::hard_link(&link_target, &new_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tar::{Builder, Header};

    fn build_archive() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());

        let data = b"hello world";
        let mut header = Header::new_gnu();
        header.set_path("regular.txt").unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();

        // Hard link entry appears before its target, on purpose.
        let mut link_header = Header::new_gnu();
        link_header.set_entry_type(EntryType::Link);
        link_header.set_path("link-to-target.txt").unwrap();
        link_header.set_link_name("target.txt").unwrap();
        link_header.set_size(0);
        link_header.set_cksum();
        builder.append(&link_header, io::empty()).unwrap();

        let target_data = b"target contents";
        let mut target_header = Header::new_gnu();
        target_header.set_path("target.txt").unwrap();
        target_header.set_size(target_data.len() as u64);
        target_header.set_mode(0o644);
        target_header.set_cksum();
        builder.append(&target_header, &target_data[..]).unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn untar_realizes_deferred_hard_links() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_archive();
        let tarball_path = dir.path().join("archive.tar");
        fs::File::create(&tarball_path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        untar(&tarball_path, dir.path()).unwrap();

        let linked = fs::read_to_string(dir.path().join("link-to-target.txt")).unwrap();
        assert_eq!(linked, "target contents");
    }

    #[test]
    fn untar_writes_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_archive();
        let tarball_path = dir.path().join("archive.tar");
        fs::File::create(&tarball_path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        untar(&tarball_path, dir.path()).unwrap();

        let contents = fs::read_to_string(dir.path().join("regular.txt")).unwrap();
        assert_eq!(contents, "hello world");
    }
}
