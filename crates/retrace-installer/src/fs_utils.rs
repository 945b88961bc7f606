use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use crate::types::Removal;

pub fn remove_file_if_exists(path: &Path) -> io::Result<Removal> {
    match fs::remove_file(path) {
        Ok(()) => Ok(Removal::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Removal::Missing),
        Err(err) => Err(err),
    }
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<Removal> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(Removal::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Removal::Missing),
        Err(err) => Err(err),
    }
}
