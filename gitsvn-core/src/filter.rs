//! Content filters.
//!
//! A filter is a bijection between stored blob bytes and the bytes a client
//! sees. The chain for a path comes from `filter=` declarations in the
//! `.gitattributes` files inherited along that path; it is applied
//! leftmost-first on read and reversed on write, so a commit followed by a
//! read always round-trips exactly.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{RepoError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// Pass-through.
    Identity,
    /// Stored bytes are gzip-compressed.
    Gzip,
    /// Stored bytes are a git-lfs pointer file; payload lives in the LFS
    /// blob directory.
    Lfs,
}

impl FilterKind {
    pub fn by_name(name: &str) -> Option<FilterKind> {
        match name {
            "identity" => Some(FilterKind::Identity),
            "gzip" => Some(FilterKind::Gzip),
            "lfs" => Some(FilterKind::Lfs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Identity => "identity",
            FilterKind::Gzip => "gzip",
            FilterKind::Lfs => "lfs",
        }
    }
}

/// Resources some filters need at run time.
#[derive(Clone, Default)]
pub struct FilterContext {
    /// Directory holding LFS payloads (`<aa>/<bb>/<sha256>` layout).
    pub lfs_dir: Option<PathBuf>,
}

/// An ordered, value-typed filter chain.
///
/// Cheap to clone and compare; [`FilterChain::cache_key`] is stable across
/// restarts and keys the `(blob, chain) -> (md5, size)` cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FilterChain(Vec<FilterKind>);

impl FilterChain {
    pub fn identity() -> Self {
        FilterChain(Vec::new())
    }

    pub fn single(kind: FilterKind) -> Self {
        if kind == FilterKind::Identity {
            Self::identity()
        } else {
            FilterChain(vec![kind])
        }
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().all(|f| *f == FilterKind::Identity)
    }

    pub fn cache_key(&self) -> String {
        if self.is_identity() {
            return "identity".to_string();
        }
        let names: Vec<&str> = self.0.iter().map(|f| f.name()).collect();
        names.join("+")
    }

    /// stored -> client-visible
    pub fn decode(&self, ctx: &FilterContext, stored: Bytes) -> Result<Bytes> {
        let mut data = stored;
        for filter in &self.0 {
            data = decode_one(*filter, ctx, data)?;
        }
        Ok(data)
    }

    /// client-visible -> stored
    pub fn encode(&self, ctx: &FilterContext, raw: Bytes) -> Result<Bytes> {
        let mut data = raw;
        for filter in self.0.iter().rev() {
            data = encode_one(*filter, ctx, data)?;
        }
        Ok(data)
    }
}

fn decode_one(filter: FilterKind, ctx: &FilterContext, data: Bytes) -> Result<Bytes> {
    match filter {
        FilterKind::Identity => Ok(data),
        FilterKind::Gzip => {
            let mut out = Vec::new();
            MultiGzDecoder::new(data.as_ref())
                .read_to_end(&mut out)
                .map_err(|err| RepoError::Filter(format!("gzip decode: {err}")))?;
            Ok(Bytes::from(out))
        }
        FilterKind::Lfs => {
            let pointer = LfsPointer::parse(&data)?;
            let dir = ctx
                .lfs_dir
                .as_deref()
                .ok_or_else(|| RepoError::Filter("lfs storage is not configured".into()))?;
            let payload = std::fs::read(pointer.storage_path(dir))
                .map_err(|err| RepoError::Filter(format!("lfs object {}: {err}", pointer.oid)))?;
            Ok(Bytes::from(payload))
        }
    }
}

fn encode_one(filter: FilterKind, ctx: &FilterContext, data: Bytes) -> Result<Bytes> {
    match filter {
        FilterKind::Identity => Ok(data),
        FilterKind::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&data)
                .map_err(|err| RepoError::Filter(format!("gzip encode: {err}")))?;
            encoder
                .finish()
                .map(Bytes::from)
                .map_err(|err| RepoError::Filter(format!("gzip encode: {err}")))
        }
        FilterKind::Lfs => {
            let dir = ctx
                .lfs_dir
                .as_deref()
                .ok_or_else(|| RepoError::Filter("lfs storage is not configured".into()))?;
            let oid = hex::encode(Sha256::digest(&data));
            let pointer = LfsPointer {
                oid: oid.clone(),
                size: data.len() as u64,
            };
            let path = pointer.storage_path(dir);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !path.exists() {
                std::fs::write(&path, &data)?;
            }
            Ok(Bytes::from(pointer.render()))
        }
    }
}

/// A git-lfs pointer file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LfsPointer {
    pub oid: String,
    pub size: u64,
}

impl LfsPointer {
    const VERSION_LINE: &'static str = "version https://git-lfs.github.com/spec/v1";

    pub fn parse(data: &[u8]) -> Result<LfsPointer> {
        let text = std::str::from_utf8(data)
            .map_err(|_| RepoError::Filter("lfs pointer is not utf-8".into()))?;
        let mut lines = text.lines();
        if lines.next() != Some(Self::VERSION_LINE) {
            return Err(RepoError::Filter("not an lfs pointer".into()));
        }
        let mut oid = None;
        let mut size = None;
        for line in lines {
            if let Some(rest) = line.strip_prefix("oid sha256:") {
                oid = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("size ") {
                size = rest.trim().parse().ok();
            }
        }
        match (oid, size) {
            (Some(oid), Some(size)) => Ok(LfsPointer { oid, size }),
            _ => Err(RepoError::Filter("incomplete lfs pointer".into())),
        }
    }

    pub fn render(&self) -> Vec<u8> {
        format!(
            "{}\noid sha256:{}\nsize {}\n",
            Self::VERSION_LINE,
            self.oid,
            self.size
        )
        .into_bytes()
    }

    fn storage_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.oid[..2]).join(&self.oid[2..4]).join(&self.oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_chain_is_noop() {
        let chain = FilterChain::identity();
        let ctx = FilterContext::default();
        let data = Bytes::from_static(b"plain bytes");
        assert_eq!(chain.decode(&ctx, data.clone()).unwrap(), data);
        assert_eq!(chain.encode(&ctx, data.clone()).unwrap(), data);
        assert!(chain.is_identity());
    }

    #[test]
    fn gzip_roundtrip() {
        let chain = FilterChain::single(FilterKind::Gzip);
        let ctx = FilterContext::default();
        let raw = Bytes::from(b"some data\n".repeat(100));
        let stored = chain.encode(&ctx, raw.clone()).unwrap();
        assert_ne!(stored, raw);
        assert_eq!(chain.decode(&ctx, stored).unwrap(), raw);
    }

    #[test]
    fn gzip_decode_of_externally_gzipped_bytes() {
        // Bytes gzipped by any producer must decode, including empty input.
        let ctx = FilterContext::default();
        let chain = FilterChain::single(FilterKind::Gzip);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(b"Test file\0").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(
            chain.decode(&ctx, Bytes::from(compressed)).unwrap(),
            Bytes::from_static(b"Test file\0")
        );
    }

    #[test]
    fn lfs_roundtrip_through_blob_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = FilterContext {
            lfs_dir: Some(dir.path().to_path_buf()),
        };
        let chain = FilterChain::single(FilterKind::Lfs);
        let raw = Bytes::from_static(b"large binary payload");
        let stored = chain.encode(&ctx, raw.clone()).unwrap();
        let pointer = LfsPointer::parse(&stored).unwrap();
        assert_eq!(pointer.size, raw.len() as u64);
        assert_eq!(chain.decode(&ctx, stored).unwrap(), raw);
    }

    #[test]
    fn lfs_without_storage_fails() {
        let ctx = FilterContext::default();
        let chain = FilterChain::single(FilterKind::Lfs);
        assert!(chain.encode(&ctx, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn unknown_filter_name() {
        assert_eq!(FilterKind::by_name("gzip"), Some(FilterKind::Gzip));
        assert_eq!(FilterKind::by_name("rot13"), None);
    }

    #[test]
    fn cache_key_is_stable() {
        assert_eq!(FilterChain::identity().cache_key(), "identity");
        assert_eq!(FilterChain::single(FilterKind::Gzip).cache_key(), "gzip");
        assert_eq!(
            FilterChain(vec![FilterKind::Gzip, FilterKind::Lfs]).cache_key(),
            "gzip+lfs"
        );
    }
}
