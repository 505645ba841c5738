//! Capture file pairs: a `.disbin` data file and its `.disbinidx` index.

use log::{debug, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use dispr_core::index::{self, record_count};
use dispr_core::IndexRecord;

use crate::error::Result;

pub const DATA_EXTENSION: &str = "disbin";
pub const INDEX_EXTENSION: &str = "disbinidx";

const TEMP_PREFIX: &str = "dispr-";

/// Index file belonging to `data`: the full data file name plus `.disbinidx`
pub fn index_path_for(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_owned();
    name.push(".");
    name.push(INDEX_EXTENSION);
    PathBuf::from(name)
}

/// First of `stem.disbin`, `stem1.disbin`, `stem2.disbin`, ... that does not exist in `dir`
pub fn free_capture_path(dir: &Path, stem: &str) -> PathBuf {
    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{}.{}", stem, DATA_EXTENSION)
        } else {
            format!("{}{}.{}", stem, n, DATA_EXTENSION)
        };
        let path = dir.join(name);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

/// Paths of a data file and its index, which are only usable together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFiles {
    pub data: PathBuf,
    pub index: PathBuf,
    /// Created by [`CaptureFiles::create_temp`] and never saved
    temporary: bool,
}

impl CaptureFiles {
    pub fn for_data(data: impl Into<PathBuf>) -> Self {
        let data = data.into();
        let index = index_path_for(&data);
        Self {
            data,
            index,
            temporary: false,
        }
    }

    /// Create an empty temporary pair with a unique `dispr-*.disbin` name in `dir`.
    ///
    /// The files are not deleted automatically; see [`CaptureFiles::remove`].
    pub fn create_temp(dir: &Path) -> Result<(Self, File, File)> {
        fs::create_dir_all(dir)?;
        let (data_file, data) = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{}", DATA_EXTENSION))
            .tempfile_in(dir)?
            .keep()
            .map_err(io::Error::from)?;
        let files = Self {
            temporary: true,
            ..Self::for_data(data)
        };
        let index_file = match File::create(&files.index) {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(&files.data);
                return Err(e.into());
            }
        };
        debug!("Created capture files {}", files.data.display());
        Ok((files, data_file, index_file))
    }

    /// True for an unsaved pair from [`CaptureFiles::create_temp`], whatever its name
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Both pairs name the same data file
    pub fn same_files(&self, other: &CaptureFiles) -> bool {
        self.data == other.data
    }

    pub fn has_index(&self) -> bool {
        self.index.is_file()
    }

    /// Number of whole records in the index file
    pub fn record_count(&self) -> Result<u64> {
        Ok(record_count(fs::metadata(&self.index)?.len()))
    }

    /// Read every record of the index file.
    ///
    /// A trailing partial record is ignored with a warning.
    pub fn read_records(&self) -> Result<Vec<IndexRecord>> {
        let bytes = fs::read(&self.index)?;
        let decoded = index::decode_all(&bytes)?;
        if decoded.trailing > 0 {
            warn!(
                "{}: ignoring {} trailing bytes",
                self.index.display(),
                decoded.trailing
            );
        }
        Ok(decoded.records)
    }

    /// Copy both files so the data file lands at `data_dest`.
    ///
    /// The returned pair is never temporary. Copying a pair onto itself only
    /// marks it as saved.
    pub fn copy_to(&self, data_dest: &Path) -> Result<CaptureFiles> {
        let dest = Self::for_data(data_dest);
        if dest.same_files(self) {
            return Ok(dest);
        }
        fs::copy(&self.data, &dest.data)?;
        fs::copy(&self.index, &dest.index)?;
        info!("Saved capture {} to {}", self.data.display(), dest.data.display());
        Ok(dest)
    }

    /// Delete both files, logging failures
    pub fn remove(&self) {
        for path in [&self.data, &self.index] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
            }
        }
    }
}
