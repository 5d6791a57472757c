// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handle to a file that mirrors the name registry's published records.
//!
//! This is not meant for production name resolution; it lets processes and
//! tooling on a local deployment discover replica addresses by reading a
//! single JSON document.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Handle to the records file. The file is removed when the handle drops.
#[derive(Debug)]
pub struct RecordsFile {
    path: PathBuf,
}

impl RecordsFile {
    /// Creates (or truncates) the records file with the given contents.
    pub fn create(
        path: impl Into<PathBuf>,
        records: &BTreeMap<String, String>,
    ) -> Result<RecordsFile, io::Error> {
        let file = RecordsFile { path: path.into() };
        file.store(records)?;
        Ok(file)
    }

    /// Rewrites the records file to match `records`.
    pub fn store(&self, records: &BTreeMap<String, String>) -> Result<(), io::Error> {
        let records = serde_json::to_string(records).expect("string map serializes");
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&self.path)?;
        writeln!(file, "{records}")
    }

    /// Reads the records in an existing records file.
    pub fn load(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>, io::Error> {
        let file = OpenOptions::new().read(true).open(path)?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        serde_json::from_str(line.trim_end())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Drop for RecordsFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
