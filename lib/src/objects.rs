//! Object identity: kinds, checksums, and the sharded on-disk filename
//! scheme.

use crate::error::CoreError;
use camino::Utf8PathBuf;
use std::fmt;

/// A 32-byte SHA-256 digest, the identity of every object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this checksum.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::invalid_format(format!(
                "not a 64-character hex checksum: {s}"
            )));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(CoreError::invalid_format(format!(
                "checksum must be lowercase: {s}"
            )));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| CoreError::invalid_format(format!("{s}: {e}")))?;
        Ok(Self(out))
    }

    /// Render as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Split into the two-character shard prefix and the remaining 62
    /// characters, as used for the on-disk object path.
    pub fn shard(&self) -> (String, String) {
        let hex = self.to_hex();
        let (a, b) = hex.split_at(2);
        (a.to_string(), b.to_string())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for Checksum {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// The four object kinds that live in the store, plus the two sibling
/// file kinds (`commitmeta`, `commitpartial`) that are addressed by a
/// commit's checksum rather than their own content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// A regular file, symlink, or device node.
    File,
    /// A directory's own `(uid, gid, mode, xattrs)`.
    DirMeta,
    /// A directory's `files` and `dirs` listings.
    DirTree,
    /// A commit.
    Commit,
    /// Signatures and non-hashed metadata attached to a commit.
    CommitMeta,
}

impl ObjectType {
    /// The filename extension for this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::Commit => "commit",
            ObjectType::CommitMeta => "commitmeta",
        }
    }

    /// Parse an extension back into its kind.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "file" => ObjectType::File,
            "dirmeta" => ObjectType::DirMeta,
            "dirtree" => ObjectType::DirTree,
            "commit" => ObjectType::Commit,
            "commitmeta" => ObjectType::CommitMeta,
            _ => return None,
        })
    }
}

/// Compute the path of an object, relative to the repository's `objects/`
/// directory, e.g. `ab/cdef...01.dirtree`.
pub fn object_relpath(checksum: &Checksum, kind: ObjectType) -> Utf8PathBuf {
    let (prefix, rest) = checksum.shard();
    Utf8PathBuf::from(prefix).join(format!("{rest}.{}", kind.extension()))
}

/// The well-known state-flag filename for a partial commit:
/// `state/<checksum>.commitpartial`.
pub fn commitpartial_relpath(checksum: &Checksum) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}.commitpartial", checksum.to_hex()))
}

/// The state-flag filename marking a deliberately tombstoned commit
/// : `state/<checksum>.committombstone`.
pub fn committombstone_relpath(checksum: &Checksum) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}.committombstone", checksum.to_hex()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn roundtrip_hex() {
        let c = Checksum::from_hex(ALL_A).unwrap();
        assert_eq!(c.to_hex(), ALL_A);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Checksum::from_hex("abc").is_err());
        assert!(Checksum::from_hex(&ALL_A.to_uppercase()).is_err());
        assert!(Checksum::from_hex(&"z".repeat(64)).is_err());
    }

    #[test]
    fn shard_split() {
        let c = Checksum::from_hex(ALL_A).unwrap();
        let (prefix, rest) = c.shard();
        assert_eq!(prefix, "aa");
        assert_eq!(rest.len(), 62);
    }

    #[test]
    fn relpath_shape() {
        let c = Checksum::from_hex(ALL_A).unwrap();
        let p = object_relpath(&c, ObjectType::DirTree);
        assert_eq!(p, Utf8PathBuf::from(format!("aa/{}.dirtree", &ALL_A[2..])));
    }
}
