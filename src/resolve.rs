// src/resolve.rs
//
// Request resolution: map the parsed URL onto the document root and classify
// the target. The precedence is fixed: missing -> 404, not world-readable ->
// 403, directory -> 400, else the file is opened read-only and mapped whole.
use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::ptr;
use std::slice;

use libc::c_void;
use tracing::{debug, error};

use crate::conn::Conn;
use crate::parser::RequestStatus;

/// Read-only private mapping of a served file. Owned by exactly one
/// connection between resolution and write completion; unmapped on drop, so
/// no exit path can leak it.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is immutable and private to the process.
unsafe impl Send for MappedFile {}

impl MappedFile {
    /// Map `len` bytes of `file`. `len` must be non-zero; zero-length files
    /// are answered with an inline placeholder body instead.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Resolve the parsed URL against `doc_root` and, for a servable file, attach
/// the mapping to the connection.
pub fn do_request(conn: &mut Conn, doc_root: &Path) -> RequestStatus {
    let path = doc_root.join(conn.url.trim_start_matches('/'));

    let meta = match fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => {
            debug!(path = %path.display(), "no such resource");
            return RequestStatus::NoResource;
        }
    };

    if meta.mode() & libc::S_IROTH == 0 {
        return RequestStatus::Forbidden;
    }
    if meta.is_dir() {
        return RequestStatus::BadRequest;
    }

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "open failed after stat");
            return RequestStatus::InternalError;
        }
    };

    let len = meta.len() as usize;
    if len > 0 {
        match MappedFile::map(&file, len) {
            Ok(mapped) => conn.file = Some(mapped),
            Err(e) => {
                error!(path = %path.display(), error = %e, "mmap failed");
                return RequestStatus::InternalError;
            }
        }
    }
    RequestStatus::FileRequest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn conn_for(url: &str) -> Conn {
        let mut conn = Conn::new();
        conn.url = url.to_string();
        conn
    }

    #[test]
    fn missing_path_is_no_resource() {
        let root = tempfile::tempdir().unwrap();
        let mut conn = conn_for("/missing.html");
        assert_eq!(
            do_request(&mut conn, root.path()),
            RequestStatus::NoResource
        );
        assert!(conn.file.is_none());
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("secret.html");
        fs::write(&path, b"hidden").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o600)).unwrap();

        let mut conn = conn_for("/secret.html");
        assert_eq!(do_request(&mut conn, root.path()), RequestStatus::Forbidden);
    }

    #[test]
    fn directory_target_is_bad_request() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        fs::set_permissions(root.path().join("sub"), Permissions::from_mode(0o755)).unwrap();

        let mut conn = conn_for("/sub");
        assert_eq!(
            do_request(&mut conn, root.path()),
            RequestStatus::BadRequest
        );
    }

    #[test]
    fn root_url_is_a_directory_hence_bad_request() {
        let root = tempfile::tempdir().unwrap();
        // tempdir() creates 0o700 dirs; make it world-readable so the
        // directory check is what trips, not the permission check.
        fs::set_permissions(root.path(), Permissions::from_mode(0o755)).unwrap();
        let mut conn = conn_for("/");
        assert_eq!(
            do_request(&mut conn, root.path()),
            RequestStatus::BadRequest
        );
    }

    #[test]
    fn unreadable_directory_is_forbidden_before_bad_request() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("locked")).unwrap();
        fs::set_permissions(
            root.path().join("locked"),
            Permissions::from_mode(0o700),
        )
        .unwrap();

        let mut conn = conn_for("/locked");
        assert_eq!(do_request(&mut conn, root.path()), RequestStatus::Forbidden);
    }

    #[test]
    fn readable_file_is_mapped_whole() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("index.html");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"<html>hello</html>").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let mut conn = conn_for("/index.html");
        assert_eq!(
            do_request(&mut conn, root.path()),
            RequestStatus::FileRequest
        );
        let mapped = conn.file.as_ref().unwrap();
        assert_eq!(mapped.bytes(), b"<html>hello</html>");
    }

    #[test]
    fn zero_length_file_skips_mapping() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("empty.html");
        fs::write(&path, b"").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let mut conn = conn_for("/empty.html");
        assert_eq!(
            do_request(&mut conn, root.path()),
            RequestStatus::FileRequest
        );
        assert!(conn.file.is_none());
    }
}
