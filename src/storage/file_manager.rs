//! Creation, opening, and deletion of database files under the base
//! directory, plus file-id assignment.
//!
//! The file manager knows nothing about page contents beyond the two-byte
//! file header; page buffers and caching live in the buffer manager.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::storage::dbfile::{self, DBFile, DBFileInfo, DBFileType};
use crate::types::FileId;

pub struct FileManager {
    base_dir: PathBuf,
    next_file_id: u32,
}

impl FileManager {
    /// Opens a file manager rooted at `base_dir`, creating the directory if
    /// needed.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<FileManager> {
        fs::create_dir_all(base_dir.as_ref())?;
        Ok(FileManager {
            base_dir: base_dir.as_ref().to_path_buf(),
            next_file_id: 1,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves a file name (relative, possibly with subdirectories for
    /// column-store files) against the base directory.
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn fresh_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        id
    }

    /// Creates a new database file and writes its first page: the type
    /// byte, the encoded page size, and zeros. Fails if the file exists.
    pub fn create_dbfile(
        &mut self,
        name: &str,
        file_type: DBFileType,
        page_size: u32,
    ) -> Result<DBFile> {
        let encoded = dbfile::encode_page_size(page_size)?;
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut first_page = vec![0u8; page_size as usize];
        first_page[0] = file_type as u8;
        first_page[1] = encoded;
        file.write_all(&first_page)?;
        file.sync_all()?;

        debug!("created {:?} file \"{}\" (page size {})", file_type, name, page_size);
        let info = DBFileInfo {
            id: self.fresh_id(),
            name: name.to_string(),
            file_type,
            page_size,
        };
        DBFile::new(info, file)
    }

    /// Opens an existing database file, reading its type and page size from
    /// the two-byte header.
    pub fn open_dbfile(&mut self, name: &str) -> Result<DBFile> {
        let path = self.resolve(name);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; 2];
        file.read_exact(&mut header)?;
        let file_type = DBFileType::from_u8(header[0])?;
        let page_size = dbfile::decode_page_size(header[1])?;

        debug!("opened {:?} file \"{}\" (page size {})", file_type, name, page_size);
        let info = DBFileInfo {
            id: self.fresh_id(),
            name: name.to_string(),
            file_type,
            page_size,
        };
        DBFile::new(info, file)
    }

    /// Opens a file when it exists, otherwise creates it.
    pub fn open_or_create_dbfile(
        &mut self,
        name: &str,
        file_type: DBFileType,
        page_size: u32,
    ) -> Result<DBFile> {
        if self.file_exists(name) {
            let file = self.open_dbfile(name)?;
            if file.file_type() != file_type {
                return Err(Error::invalid_arg(format!(
                    "file \"{}\" is a {:?} file, expected {:?}",
                    name,
                    file.file_type(),
                    file_type
                )));
            }
            Ok(file)
        } else {
            self.create_dbfile(name, file_type, page_size)
        }
    }

    /// Removes a file from disk. The caller must have flushed and released
    /// its cached pages first.
    pub fn delete_dbfile(&self, name: &str) -> Result<()> {
        fs::remove_file(self.resolve(name))?;
        debug!("deleted file \"{}\"", name);
        Ok(())
    }

    /// Opens a raw (non-DBFile) handle; used by the write-ahead log, which
    /// does byte-stream I/O rather than page I/O.
    pub fn open_raw(&self, name: &str, create: bool) -> Result<File> {
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path()).unwrap();

        let created = fm
            .create_dbfile("t.tbl", DBFileType::HeapTupleFile, 1024)
            .unwrap();
        assert_eq!(created.page_size(), 1024);
        assert_eq!(created.num_pages().unwrap(), 1);

        let opened = fm.open_dbfile("t.tbl").unwrap();
        assert_eq!(opened.file_type(), DBFileType::HeapTupleFile);
        assert_eq!(opened.page_size(), 1024);
        assert_ne!(opened.id(), created.id());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path()).unwrap();
        fm.create_dbfile("t.tbl", DBFileType::HeapTupleFile, 512)
            .unwrap();
        assert!(fm
            .create_dbfile("t.tbl", DBFileType::HeapTupleFile, 512)
            .is_err());
    }

    #[test]
    fn test_subdirectory_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path()).unwrap();
        fm.create_dbfile("emp/emp.name.tbl", DBFileType::ColumnStoreDataFile, 512)
            .unwrap();
        assert!(fm.file_exists("emp/emp.name.tbl"));
        fm.delete_dbfile("emp/emp.name.tbl").unwrap();
        assert!(!fm.file_exists("emp/emp.name.tbl"));
    }

    #[test]
    fn test_page_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path()).unwrap();
        let mut file = fm
            .create_dbfile("t.tbl", DBFileType::HeapTupleFile, 512)
            .unwrap();

        let mut page = vec![0u8; 512];
        page[0] = 0xab;
        file.write_page(3, &page).unwrap();
        assert_eq!(file.num_pages().unwrap(), 4);

        let mut buf = vec![0u8; 512];
        assert!(file.read_page(3, &mut buf).unwrap());
        assert_eq!(buf[0], 0xab);
        assert!(!file.read_page(4, &mut buf).unwrap());
    }
}
