use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub rel_path: PathBuf,
    pub contents: Vec<u8>,
}

pub struct ZipPayload<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    next_index: usize,
}

impl<'a> ZipPayload<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let archive =
            ZipArchive::new(Cursor::new(bytes)).context("failed to open appended zip archive")?;
        Ok(Self {
            archive,
            next_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    fn read_entry(&mut self, index: usize) -> Result<Option<PayloadEntry>> {
        let mut file = self
            .archive
            .by_index(index)
            .with_context(|| format!("failed to read archive member #{index}"))?;
        if file.is_dir() {
            return Ok(None);
        }

        let name = file.name().to_string();
        let rel_path = validated_relative_payload_path(&name)?.to_path_buf();
        let mut contents = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut contents)
            .with_context(|| format!("failed to decompress archive member: {name}"))?;
        Ok(Some(PayloadEntry { rel_path, contents }))
    }
}

impl Iterator for ZipPayload<'_> {
    type Item = Result<PayloadEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_index < self.archive.len() {
            let index = self.next_index;
            self.next_index += 1;
            match self.read_entry(index) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.archive.len() - self.next_index))
    }
}

pub fn validated_relative_payload_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("payload path must not be empty"));
    }
    if path.chars().any(char::is_control) {
        return Err(anyhow!(
            "payload path contains control characters: {}",
            path.escape_debug()
        ));
    }
    if relative.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(anyhow!("payload path must be relative: {path}"));
    }
    if relative.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        )
    }) {
        return Err(anyhow!("payload path must not escape the target: {path}"));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(anyhow!("payload path must not include '..': {path}"));
    }
    Ok(relative)
}
