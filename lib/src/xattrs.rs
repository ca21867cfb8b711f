//! Canonical extended-attribute encoding, the piece of the checksum
//! kernel that guarantees repositories built on different hosts
//! converge to identical checksums regardless of xattr order.

use rustix::fs::{Mode, OFlags};
use std::os::fd::{AsFd, BorrowedFd};

/// A single extended attribute, name and raw value.
pub type Xattr = (Vec<u8>, Vec<u8>);

/// Serialize a set of xattrs into the canonical blob: names sorted
/// byte-wise, each entry as `name NUL u32be(len) value`.
pub fn canonicalize(mut xattrs: Vec<Xattr>) -> Vec<u8> {
    xattrs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = Vec::new();
    for (name, value) in xattrs {
        out.extend_from_slice(&name);
        out.push(0);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(&value);
    }
    out
}

/// Read every xattr on an open file descriptor via `flistxattr`/`fgetxattr`,
/// treating `ENOTSUP` as "no xattrs" and propagating any other error.
pub fn read_fd_xattrs(fd: BorrowedFd<'_>) -> std::io::Result<Vec<Xattr>> {
    let mut list_buf = vec![0u8; 4096];
    let list_len = loop {
        match rustix::fs::flistxattr(fd, &mut list_buf) {
            Ok(len) => break len,
            Err(rustix::io::Errno::RANGE) => {
                list_buf.resize(list_buf.len() * 2, 0);
            }
            Err(e) if e == rustix::io::Errno::OPNOTSUPP => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
    };
    let names: Vec<Vec<u8>> = list_buf[..list_len]
        .split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| name.to_vec())
        .collect();
    let mut out = Vec::with_capacity(names.len());
    'names: for name in names {
        let mut value_buf = vec![0u8; 4096];
        let value = loop {
            match rustix::fs::fgetxattr(fd, name.as_slice(), &mut value_buf) {
                Ok(len) => break value_buf[..len].to_vec(),
                Err(rustix::io::Errno::RANGE) => {
                    value_buf.resize(value_buf.len() * 2, 0);
                }
                Err(e) if e == rustix::io::Errno::OPNOTSUPP => continue 'names,
                Err(e) => return Err(e.into()),
            }
        };
        out.push((name, value));
    }
    Ok(out)
}

/// Read the xattrs of a path without following the final symlink
/// component, via `O_PATH`/`O_NOFOLLOW` plus `flistxattr` on the
/// resulting descriptor. Used when importing raw files into the store.
pub fn read_path_xattrs(dir_fd: BorrowedFd<'_>, path: &std::path::Path) -> std::io::Result<Vec<Xattr>> {
    let fd = rustix::fs::openat(
        dir_fd,
        path,
        OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    read_fd_xattrs(fd.as_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_independent_of_input_order() {
        let a = vec![
            (b"user.b".to_vec(), b"2".to_vec()),
            (b"user.a".to_vec(), b"1".to_vec()),
        ];
        let b = vec![
            (b"user.a".to_vec(), b"1".to_vec()),
            (b"user.b".to_vec(), b"2".to_vec()),
        ];
        assert_eq!(canonicalize(a), canonicalize(b));
    }

    #[test]
    fn empty_is_empty() {
        assert!(canonicalize(Vec::new()).is_empty());
    }

    #[test]
    fn encodes_length_prefix() {
        let out = canonicalize(vec![(b"n".to_vec(), b"abcd".to_vec())]);
        // "n" + NUL + u32be(4) + "abcd"
        assert_eq!(out, b"n\0\0\0\0\x04abcd".to_vec());
    }
}
