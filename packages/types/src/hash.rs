//! Hash algorithms and the multi-hasher used for upload digest computation

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;

/// Digest algorithms drivers can request for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Md5,
    Sha1,
    Sha256,
    /// Block-wise SHA-1 digest used by download-accelerator backends.
    Gcid,
}

impl HashAlg {
    /// Length of the hex encoding of a digest of this algorithm.
    pub fn hex_width(&self) -> usize {
        match self {
            HashAlg::Md5 => 32,
            HashAlg::Sha1 | HashAlg::Gcid => 40,
            HashAlg::Sha256 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlg::Md5 => "md5",
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Gcid => "gcid",
        }
    }
}

/// A set of known digests for one object, keyed by algorithm.
///
/// Values are lowercase hex. Entries whose length does not match the
/// algorithm's width are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashInfo(BTreeMap<HashAlg, String>);

impl HashInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alg: HashAlg) -> Option<&str> {
        self.0
            .get(&alg)
            .map(String::as_str)
            .filter(|v| v.len() == alg.hex_width())
    }

    pub fn set(&mut self, alg: HashAlg, value: impl Into<String>) {
        self.0.insert(alg, value.into());
    }

    /// Merge `other` into `self`, overwriting existing entries.
    pub fn merge(&mut self, other: &HashInfo) {
        for (alg, val) in other.iter() {
            self.0.insert(alg, val.to_string());
        }
    }

    /// Returns the requested digests iff every one of them is known.
    pub fn get_all(&self, algs: &[HashAlg]) -> Option<Vec<(HashAlg, String)>> {
        algs.iter()
            .map(|&alg| self.get(alg).map(|v| (alg, v.to_string())))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HashAlg, &str)> {
        self.0.iter().map(|(&alg, v)| (alg, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Feeds one pass over the data into every requested digest at once.
pub struct MultiHasher {
    md5: Option<Md5>,
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
    gcid: Option<Gcid>,
}

impl MultiHasher {
    /// `total_size` is needed up front because the GCID block size depends on
    /// the full length of the data.
    pub fn new(algs: &[HashAlg], total_size: u64) -> Self {
        let mut hasher = Self {
            md5: None,
            sha1: None,
            sha256: None,
            gcid: None,
        };
        for alg in algs {
            match alg {
                HashAlg::Md5 => hasher.md5 = Some(Md5::new()),
                HashAlg::Sha1 => hasher.sha1 = Some(Sha1::new()),
                HashAlg::Sha256 => hasher.sha256 = Some(Sha256::new()),
                HashAlg::Gcid => hasher.gcid = Some(Gcid::new(total_size)),
            }
        }
        hasher
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(h) = &mut self.md5 {
            h.update(data);
        }
        if let Some(h) = &mut self.sha1 {
            h.update(data);
        }
        if let Some(h) = &mut self.sha256 {
            h.update(data);
        }
        if let Some(h) = &mut self.gcid {
            h.update(data);
        }
    }

    pub fn finalize(self) -> HashInfo {
        let mut info = HashInfo::new();
        if let Some(h) = self.md5 {
            info.set(HashAlg::Md5, hex::encode(h.finalize()));
        }
        if let Some(h) = self.sha1 {
            info.set(HashAlg::Sha1, hex::encode(h.finalize()));
        }
        if let Some(h) = self.sha256 {
            info.set(HashAlg::Sha256, hex::encode(h.finalize()));
        }
        if let Some(h) = self.gcid {
            info.set(HashAlg::Gcid, hex::encode(h.finalize()));
        }
        info
    }
}

/// GCID: SHA-1 over the SHA-1 digests of fixed-size blocks.
///
/// The block size starts at 256 KiB and doubles (up to 2 MiB) until the data
/// spans at most 512 blocks.
struct Gcid {
    block_size: u64,
    block: Sha1,
    filled: u64,
    total: Sha1,
}

impl Gcid {
    fn new(total_size: u64) -> Self {
        let mut block_size: u64 = 0x40000;
        while total_size / block_size > 0x200 && block_size < 0x20_0000 {
            block_size <<= 1;
        }
        Self {
            block_size,
            block: Sha1::new(),
            filled: 0,
            total: Sha1::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (self.block_size - self.filled) as usize;
            let take = room.min(data.len());
            self.block.update(&data[..take]);
            self.filled += take as u64;
            data = &data[take..];
            if self.filled == self.block_size {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let digest = std::mem::replace(&mut self.block, Sha1::new()).finalize();
        self.total.update(digest);
        self.filled = 0;
    }

    fn finalize(mut self) -> [u8; 20] {
        if self.filled > 0 {
            self.flush_block();
        }
        self.total.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_hasher_known_digests() {
        let mut hasher = MultiHasher::new(&[HashAlg::Md5, HashAlg::Sha1, HashAlg::Sha256], 3);
        hasher.update(b"abc");
        let info = hasher.finalize();
        assert_eq!(
            info.get(HashAlg::Md5),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(
            info.get(HashAlg::Sha1),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            info.get(HashAlg::Sha256),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn gcid_single_block_is_sha1_of_block_digest() {
        let mut hasher = MultiHasher::new(&[HashAlg::Gcid], 3);
        hasher.update(b"abc");
        let info = hasher.finalize();

        let block = Sha1::digest(b"abc");
        let expected = hex::encode(Sha1::digest(block));
        assert_eq!(info.get(HashAlg::Gcid), Some(expected.as_str()));
    }

    #[test]
    fn gcid_block_size_scales_with_total() {
        assert_eq!(Gcid::new(0).block_size, 0x40000);
        assert_eq!(Gcid::new(128 << 20).block_size, 0x40000);
        assert_eq!(Gcid::new(1 << 30).block_size, 0x20_0000);
    }

    #[test]
    fn hash_info_rejects_wrong_width() {
        let mut info = HashInfo::new();
        info.set(HashAlg::Md5, "abc");
        assert_eq!(info.get(HashAlg::Md5), None);
        assert!(info.get_all(&[HashAlg::Md5]).is_none());
    }

    #[test]
    fn hash_info_get_all_requires_every_alg() {
        let mut info = HashInfo::new();
        info.set(HashAlg::Md5, "0".repeat(32));
        info.set(HashAlg::Sha1, "1".repeat(40));
        assert!(info.get_all(&[HashAlg::Md5, HashAlg::Sha1]).is_some());
        assert!(info
            .get_all(&[HashAlg::Md5, HashAlg::Sha1, HashAlg::Sha256])
            .is_none());
    }
}
