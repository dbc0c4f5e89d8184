//! In-memory tar archives for build contexts and container file uploads.

use std::collections::BTreeMap;
use std::io;

use tar::{Builder, Header};

use crate::execution::engine::ContextDir;

fn file_mode(path: &str) -> u32 {
    if path.ends_with(".sh") {
        0o755
    } else {
        0o644
    }
}

fn append_bytes(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(file_mode(path));
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path.trim_start_matches('/'), data)
}

/// Packs a Dockerfile, extra files and host directories into a build context.
pub fn build_context(
    dockerfile: &str,
    files: &BTreeMap<String, Vec<u8>>,
    dirs: &[ContextDir],
) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);

    append_bytes(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
    for (path, data) in files {
        append_bytes(&mut builder, path, data)?;
    }
    for dir in dirs {
        if !dir.host.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("context directory {} does not exist", dir.host.display()),
            ));
        }
        builder.append_dir_all(dir.dest.trim_start_matches('/'), &dir.host)?;
    }

    builder.into_inner()
}

/// Packs files keyed by absolute container path, for upload at `/`.
pub fn upload_archive(files: &BTreeMap<String, Vec<u8>>) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (path, data) in files {
        append_bytes(&mut builder, path, data)?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn entries(archive: &[u8]) -> BTreeMap<String, (u32, String)> {
        let mut out = BTreeMap::new();
        let mut reader = tar::Archive::new(archive);
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mode = entry.header().mode().unwrap();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            out.insert(path, (mode, body));
        }
        out
    }

    #[test]
    fn test_build_context_contains_dockerfile_and_files() {
        let mut files = BTreeMap::new();
        files.insert("run.sh".to_string(), b"echo hi".to_vec());
        files.insert("fix.patch".to_string(), b"diff".to_vec());

        let archive = build_context("FROM scratch\n", &files, &[]).unwrap();
        let entries = entries(&archive);
        assert_eq!(entries["Dockerfile"].1, "FROM scratch\n");
        assert_eq!(entries["run.sh"].0, 0o755);
        assert_eq!(entries["fix.patch"].0, 0o644);
    }

    #[test]
    fn test_build_context_includes_host_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("go.mod"), "module example\n").unwrap();
        let dirs = vec![ContextDir {
            host: tmp.path().to_path_buf(),
            dest: "gin".to_string(),
        }];

        let archive = build_context("FROM scratch\n", &BTreeMap::new(), &dirs).unwrap();
        let entries = entries(&archive);
        assert_eq!(entries["gin/go.mod"].1, "module example\n");
    }

    #[test]
    fn test_missing_context_directory_is_an_error() {
        let dirs = vec![ContextDir {
            host: "/nonexistent/checkout".into(),
            dest: "repo".to_string(),
        }];
        assert!(build_context("FROM scratch\n", &BTreeMap::new(), &dirs).is_err());
    }

    #[test]
    fn test_upload_archive_strips_leading_slash() {
        let mut files = BTreeMap::new();
        files.insert("/home/fix.patch".to_string(), b"candidate".to_vec());
        let archive = upload_archive(&files).unwrap();
        assert_eq!(entries(&archive)["home/fix.patch"].1, "candidate");
    }
}
