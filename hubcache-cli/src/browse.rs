//! Offline browsing of cached snapshots through `hf://` urls

use anyhow::Result;
use hubcache_core::{CacheFileSystem, HfUrl, format_size};
use std::io::Write;

/// Apply a `--revision` override to a url
pub fn with_revision(fs: &CacheFileSystem, url: &str, revision: Option<&str>) -> Result<String> {
    match revision {
        None => Ok(url.to_string()),
        Some(revision) => {
            let mut parsed = HfUrl::resolve(url, fs.store())?;
            parsed.revision = Some(revision.to_string());
            Ok(parsed.to_string())
        }
    }
}

pub fn ls(out: &mut impl Write, fs: &CacheFileSystem, url: &str, long: bool) -> Result<()> {
    if url.contains(['*', '?', '[']) {
        for matched in fs.glob(url)? {
            writeln!(out, "{}", matched)?;
        }
        return Ok(());
    }

    for entry in fs.ls(url)? {
        if long {
            let size = if entry.is_dir() { "-".to_string() } else { format_size(entry.size) };
            let kind = if entry.is_dir() { "dir" } else { "file" };
            writeln!(out, "{:<4} {:>8}  {}", kind, size, entry.name)?;
        } else {
            writeln!(out, "{}", entry.name)?;
        }
    }
    Ok(())
}

pub fn cat(out: &mut impl Write, fs: &CacheFileSystem, url: &str) -> Result<()> {
    out.write_all(&fs.read(url)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubcache_core::{CacheStore, RepoId, RepoType};
    use tempfile::TempDir;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";

    fn setup() -> (TempDir, CacheFileSystem) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        let repo = store.repo(RepoType::Dataset, &RepoId::parse("org/data").unwrap());
        repo.insert_file("main", C1, "README.md", b"# data\n", None).unwrap();
        repo.insert_file("main", C1, "train/part-0.csv", b"a,b\n", None).unwrap();
        repo.insert_file("refs/pr/1", C2, "README.md", b"# draft\n", None).unwrap();
        (dir, CacheFileSystem::new(store))
    }

    #[test]
    fn test_ls_and_glob() {
        let (_dir, fs) = setup();
        let mut buf = Vec::new();
        ls(&mut buf, &fs, "hf://datasets/org/data", false).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "hf://datasets/org/data/README.md\nhf://datasets/org/data/train\n"
        );

        let mut buf = Vec::new();
        ls(&mut buf, &fs, "hf://datasets/org/data/**/*.csv", false).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "hf://datasets/org/data/train/part-0.csv\n");

        let mut buf = Vec::new();
        ls(&mut buf, &fs, "hf://datasets/org/data", true).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("file      7.0  "));
    }

    #[test]
    fn test_cat_with_revision_override() {
        let (_dir, fs) = setup();
        let mut buf = Vec::new();
        cat(&mut buf, &fs, "hf://datasets/org/data/README.md").unwrap();
        assert_eq!(buf, b"# data\n");

        let url = with_revision(&fs, "hf://datasets/org/data/README.md", Some("refs/pr/1")).unwrap();
        assert_eq!(url, "hf://datasets/org/data@refs/pr/1/README.md");
        let mut buf = Vec::new();
        cat(&mut buf, &fs, &url).unwrap();
        assert_eq!(buf, b"# draft\n");
    }
}
