//! The checksum kernel: a deterministic 32-byte digest for each of the
//! four object kinds. Everything else in this crate depends on this
//! module producing the same bytes for the same logical object
//! regardless of storage mode or host.

use crate::codec;
use crate::objects::Checksum;
use crate::xattrs::Xattr;
use sha2::{Digest, Sha256};

/// File-type bits masked out of `mode` before hashing.
const S_IFMT: u32 = 0o170000;

/// The payload carried by a file object: regular content, a symlink
/// target, or a device's `rdev`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent<'a> {
    /// Regular file content, hashed byte-for-byte with no length prefix.
    Regular(&'a [u8]),
    /// A symlink target path, hashed as raw bytes with no trailing NUL.
    Symlink(&'a [u8]),
    /// A character or block device's `rdev`, hashed as decimal ASCII.
    Device(u64),
}

/// Compute the checksum of a file object: the canonical `(uid, gid,
/// mode)` preamble, then the canonical xattrs blob, then the content
/// bytes appropriate to the file's type.
pub fn file_checksum(uid: u32, gid: u32, mode: u32, xattrs: &[Xattr], content: FileContent<'_>) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(uid.to_be_bytes());
    hasher.update(gid.to_be_bytes());
    hasher.update((mode & !S_IFMT).to_be_bytes());
    hasher.update(crate::xattrs::canonicalize(xattrs.to_vec()));
    match content {
        FileContent::Regular(bytes) => hasher.update(bytes),
        FileContent::Symlink(target) => hasher.update(target),
        FileContent::Device(rdev) => hasher.update(rdev.to_string().as_bytes()),
    };
    let digest: [u8; 32] = hasher.finalize().into();
    Checksum::from_bytes(digest)
}

/// Compute the checksum of a dirmeta object: SHA-256 of its canonical
/// encoding.
pub fn dirmeta_checksum(meta: &codec::DirMeta) -> Checksum {
    hash_bytes(&codec::encode_dirmeta(meta))
}

/// Compute the checksum of a dirtree object: SHA-256 of its canonical
/// encoding.
pub fn dirtree_checksum(tree: &codec::DirTree) -> anyhow::Result<Checksum> {
    Ok(hash_bytes(&codec::encode_dirtree(tree)?))
}

/// Compute the checksum of a commit object: SHA-256 of its canonical
/// encoding. This is also the value signatures in a commitmeta are
/// computed over: verification is over the raw serialized bytes of the
/// commit object, not its checksum.
pub fn commit_checksum(commit: &codec::Commit) -> Checksum {
    hash_bytes(&codec::encode_commit(commit))
}

fn hash_bytes(buf: &[u8]) -> Checksum {
    let digest: [u8; 32] = Sha256::digest(buf).into();
    Checksum::from_bytes(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism() {
        let a = file_checksum(0, 0, 0o100644, &[], FileContent::Regular(b"hi\n"));
        let b = file_checksum(0, 0, 0o100644, &[], FileContent::Regular(b"hi\n"));
        assert_eq!(a, b);
    }

    #[test]
    fn xattr_permutation_does_not_change_checksum() {
        let x1 = vec![(b"user.b".to_vec(), b"2".to_vec()), (b"user.a".to_vec(), b"1".to_vec())];
        let x2 = vec![(b"user.a".to_vec(), b"1".to_vec()), (b"user.b".to_vec(), b"2".to_vec())];
        let a = file_checksum(0, 0, 0o100644, &x1, FileContent::Regular(b"x"));
        let b = file_checksum(0, 0, 0o100644, &x2, FileContent::Regular(b"x"));
        assert_eq!(a, b);
    }

    #[test]
    fn type_bits_are_stripped() {
        let a = file_checksum(0, 0, 0o100644, &[], FileContent::Regular(b"x"));
        let b = file_checksum(0, 0, 0o644, &[], FileContent::Regular(b"x"));
        assert_eq!(a, b);
    }

    /// A regular file `hello` with content `b"hi\n"`, mode 0644, uid/gid
    /// 1000, no xattrs.
    #[test]
    fn hello_file() {
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(1000u32.to_be_bytes());
            hasher.update(1000u32.to_be_bytes());
            hasher.update(0o644u32.to_be_bytes());
            hasher.update(b"hi\n");
            let digest: [u8; 32] = hasher.finalize().into();
            Checksum::from_bytes(digest)
        };
        let actual = file_checksum(1000, 1000, 0o100644, &[], FileContent::Regular(b"hi\n"));
        assert_eq!(actual, expected);
    }

    /// A root dirmeta with uid=gid=0, mode=0755, no xattrs hashes to
    /// SHA-256 of the 12-byte preamble with empty xattrs.
    #[test]
    fn root_dirmeta() {
        let meta = codec::DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] };
        let mut expected_input = Vec::new();
        expected_input.extend_from_slice(&0u32.to_be_bytes());
        expected_input.extend_from_slice(&0u32.to_be_bytes());
        expected_input.extend_from_slice(&0o755u32.to_be_bytes());
        expected_input.extend_from_slice(&0u32.to_be_bytes()); // empty xattrs blob length
        let expected = hash_bytes(&expected_input);
        assert_eq!(dirmeta_checksum(&meta), expected);
    }

    #[test]
    fn empty_dirtree() {
        let tree = codec::DirTree::default();
        let expected = hash_bytes(&codec::encode_dirtree(&tree).unwrap());
        assert_eq!(dirtree_checksum(&tree).unwrap(), expected);
    }
}
