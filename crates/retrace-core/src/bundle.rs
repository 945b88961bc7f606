use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::setup::SetupData;

pub const BUNDLE_MAGIC: &[u8; 8] = b"RETRACE1";
pub const TRAILER_LEN: usize = 8 + 8 + 8 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    bytes: Vec<u8>,
    stub_len: usize,
    setup_len: usize,
    archive_len: usize,
}

impl Bundle {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read installer bundle: {}", path.display()))?;
        Self::from_bytes(bytes)
            .with_context(|| format!("invalid installer bundle: {}", path.display()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < TRAILER_LEN {
            return Err(anyhow!(
                "no appended payload found (file is {} bytes)",
                bytes.len()
            ));
        }

        let trailer = &bytes[bytes.len() - TRAILER_LEN..];
        if &trailer[..8] != BUNDLE_MAGIC {
            return Err(anyhow!("no appended payload found (trailer magic missing)"));
        }

        let setup_len = read_len(&trailer[8..16])?;
        let archive_len = read_len(&trailer[16..24])?;
        let expected_digest = &trailer[24..];

        let body_len = bytes.len() - TRAILER_LEN;
        let payload_len = setup_len
            .checked_add(archive_len)
            .filter(|len| *len <= body_len)
            .ok_or_else(|| {
                anyhow!(
                    "appended payload lengths exceed file size (setup={setup_len}, archive={archive_len}, available={body_len})"
                )
            })?;
        let stub_len = body_len - payload_len;

        let actual_digest = Sha256::digest(&bytes[stub_len..body_len]);
        if actual_digest.as_slice() != expected_digest {
            return Err(anyhow!(
                "payload digest mismatch: expected {}, got {}",
                hex::encode(expected_digest),
                hex::encode(actual_digest)
            ));
        }

        Ok(Self {
            bytes,
            stub_len,
            setup_len,
            archive_len,
        })
    }

    pub fn stub_bytes(&self) -> &[u8] {
        &self.bytes[..self.stub_len]
    }

    pub fn setup_bytes(&self) -> &[u8] {
        &self.bytes[self.stub_len..self.stub_len + self.setup_len]
    }

    pub fn archive_bytes(&self) -> &[u8] {
        let start = self.stub_len + self.setup_len;
        &self.bytes[start..start + self.archive_len]
    }

    pub fn payload_sha256(&self) -> String {
        let body_len = self.bytes.len() - TRAILER_LEN;
        hex::encode(Sha256::digest(&self.bytes[self.stub_len..body_len]))
    }

    pub fn setup(&self) -> Result<SetupData> {
        let raw = std::str::from_utf8(self.setup_bytes())
            .context("appended setup data is not valid UTF-8")?;
        SetupData::from_toml_str(raw)
    }
}

pub fn build_bundle(stub: &[u8], setup: &str, archive: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(setup.as_bytes());
    hasher.update(archive);
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(stub.len() + setup.len() + archive.len() + TRAILER_LEN);
    out.extend_from_slice(stub);
    out.extend_from_slice(setup.as_bytes());
    out.extend_from_slice(archive);
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&(setup.len() as u64).to_le_bytes());
    out.extend_from_slice(&(archive.len() as u64).to_le_bytes());
    out.extend_from_slice(&digest);
    out
}

fn read_len(raw: &[u8]) -> Result<usize> {
    let array: [u8; 8] = raw
        .try_into()
        .map_err(|_| anyhow!("invalid trailer length field"))?;
    usize::try_from(u64::from_le_bytes(array)).context("trailer length does not fit in memory")
}
