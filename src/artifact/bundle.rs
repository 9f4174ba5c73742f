//! Deterministic `tar.zst` bundles of an image directory.
//!
//! Entries are sorted by relative path and carry zeroed mtime/uid/gid, so the
//! same directory contents always produce the same bytes.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tar::{Builder as TarBuilder, EntryType, Header};
use walkdir::WalkDir;

const ZSTD_LEVEL: i32 = 3;

fn entry_header(kind: EntryType, size: u64, md: &fs::Metadata, fallback_mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fallback_mode;
        header.set_mode(md.permissions().mode());
    }
    #[cfg(not(unix))]
    {
        let _ = md;
        header.set_mode(fallback_mode);
    }
    header
}

fn sorted_entries(src_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.with_context(|| format!("walking '{}'", src_dir.display()))?;
        if ent.path() != src_dir {
            entries.push(ent.into_path());
        }
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });
    Ok(entries)
}

/// Write `src_dir` as a zstd-compressed tarball at `out_path`.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating bundle '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)
        .with_context(|| format!("starting zstd stream for '{}'", out_path.display()))?;
    let mut builder = TarBuilder::new(encoder);

    for p in sorted_entries(src_dir)? {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");
        let md = fs::symlink_metadata(&p)
            .with_context(|| format!("reading metadata of '{}'", p.display()))?;

        if md.is_dir() {
            let mut header = entry_header(EntryType::Directory, 0, &md, 0o755);
            header.set_cksum();
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)
                .with_context(|| format!("reading symlink '{}'", p.display()))?;
            let mut header = entry_header(EntryType::Symlink, 0, &md, 0o777);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p).with_context(|| format!("opening '{}'", p.display()))?;
            let mut header = entry_header(EntryType::Regular, md.len(), &md, 0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, &mut f)
                .with_context(|| format!("adding '{}' to bundle", rel))?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing tar stream")?;
    encoder.finish().context("finalizing zstd stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn list_entries(bundle: &Path) -> Vec<String> {
        let decoder = zstd::stream::Decoder::new(File::open(bundle).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn bundle_is_sorted_and_reproducible() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("image");
        fs::create_dir_all(image.join("lib")).unwrap();
        fs::write(image.join("lib/b.jar"), b"b").unwrap();
        fs::write(image.join("app.jar"), b"app").unwrap();

        let first = tmp.path().join("one.tar.zst");
        let second = tmp.path().join("two.tar.zst");
        create_tar_zst(&image, &first).unwrap();
        create_tar_zst(&image, &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        let entries = list_entries(&first);
        assert_eq!(entries[0], "app.jar");
        assert!(entries[1].starts_with("lib"));
        assert_eq!(entries[2], "lib/b.jar");
    }
}
