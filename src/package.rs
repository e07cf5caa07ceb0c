//! Item Vault - Package Assembly
//!
//! A package is a zip archive holding `data.json` plus the encrypted image
//! files written by a save. The save pipeline only sees the [`PackageBuilder`]
//! trait, so any container can stand in for zip.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{VaultError, VaultResult};

/// Sink for the files of one package
pub trait PackageBuilder {
    fn add_from_bytes(&mut self, name: &str, bytes: &[u8]) -> VaultResult<()>;

    fn add_from_text(&mut self, name: &str, text: &str) -> VaultResult<()> {
        self.add_from_bytes(name, text.as_bytes())
    }

    /// Close the package and return its bytes
    fn finalize(&mut self) -> VaultResult<Vec<u8>>;
}

/// Creates a builder for a package with the given datasource name
pub type PackageFactory = fn(&str) -> Box<dyn PackageBuilder + Send>;

pub fn zip_package_factory(datasource_name: &str) -> Box<dyn PackageBuilder + Send> {
    Box::new(ZipPackageBuilder::new(datasource_name))
}

/// In-memory zip writer
pub struct ZipPackageBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    files: usize,
}

impl ZipPackageBuilder {
    pub fn new(datasource_name: &str) -> Self {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.set_comment(datasource_name);
        Self { writer, files: 0 }
    }
}

impl PackageBuilder for ZipPackageBuilder {
    fn add_from_bytes(&mut self, name: &str, bytes: &[u8]) -> VaultResult<()> {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer.start_file(name, options)?;
        self.writer.write_all(bytes)?;
        self.files += 1;
        Ok(())
    }

    fn finalize(&mut self) -> VaultResult<Vec<u8>> {
        let cursor = self.writer.finish()?;
        log::debug!("Package finalized with {} files", self.files);
        Ok(cursor.into_inner())
    }
}

/// Files of an opened package
#[derive(Debug, Clone, Default)]
pub struct PackageReader {
    files: BTreeMap<String, Vec<u8>>,
}

impl PackageReader {
    pub fn open(bytes: &[u8]) -> VaultResult<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut files = BTreeMap::new();
        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let mut content = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut content)?;
            files.insert(file.name().to_string(), content);
        }
        Ok(Self { files })
    }

    pub fn from_files(files: BTreeMap<String, Vec<u8>>) -> Self {
        Self { files }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// The encrypted datasource record, as text
    pub fn data_text(&self, data_file_name: &str) -> VaultResult<String> {
        let bytes = self
            .get(data_file_name)
            .ok_or_else(|| {
                VaultError::Package(format!("{} missing from package", data_file_name))
            })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| VaultError::Parse(format!("{} is not UTF-8: {}", data_file_name, e)))
    }

    /// Overlay another package, its files winning on name clashes
    pub fn merge(&mut self, newer: PackageReader) {
        self.files.extend(newer.files);
    }

    pub fn into_files(self) -> BTreeMap<String, Vec<u8>> {
        self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_roundtrip() {
        let mut builder = zip_package_factory("books");
        builder.add_from_text("data.json", "{\"a\":1}").unwrap();
        builder.add_from_bytes("pool.png", &[1, 2, 3, 4]).unwrap();
        let bytes = builder.finalize().unwrap();

        let reader = PackageReader::open(&bytes).unwrap();
        assert_eq!(reader.names().collect::<Vec<_>>(), vec!["data.json", "pool.png"]);
        assert_eq!(reader.data_text("data.json").unwrap(), "{\"a\":1}");
        assert_eq!(reader.get("pool.png"), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_missing_data_file() {
        let mut builder = ZipPackageBuilder::new("empty");
        let bytes = builder.finalize().unwrap();
        let reader = PackageReader::open(&bytes).unwrap();
        assert!(matches!(reader.data_text("data.json"), Err(VaultError::Package(_))));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(PackageReader::open(b"plain text").is_err());
    }

    #[test]
    fn test_merge_prefers_newer() {
        let mut base = PackageReader::from_files(BTreeMap::from([
            ("data.json".to_string(), b"old".to_vec()),
            ("a.webp".to_string(), vec![1]),
        ]));
        let newer = BTreeMap::from([("data.json".to_string(), b"new".to_vec())]);
        base.merge(PackageReader::from_files(newer));
        assert_eq!(base.get("data.json"), Some(&b"new"[..]));
        assert_eq!(base.get("a.webp"), Some(&[1u8][..]));
    }
}
