use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::ColorimeterError;
use crate::series::Series;

const ARCHIVE_PREFIX: &str = "m_";
const ARCHIVE_EXTENSION: &str = "json";

/// Named measurement archives, one file per run, in a single directory.
///
/// `save` goes through a temporary sibling and a rename, so the per-cycle
/// checkpoint writes can never leave a torn archive behind, whatever cycle the
/// run dies in.
#[derive(Clone, Debug)]
pub struct SampleStore {
    dir: PathBuf,
}

impl SampleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{ARCHIVE_PREFIX}{name}.{ARCHIVE_EXTENSION}"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    pub(crate) fn validate_name(name: &str) -> Result<(), ColorimeterError> {
        if name.is_empty() {
            return Err(ColorimeterError::InvalidParameter(
                "archive name must not be empty".to_string(),
            ));
        }
        if name.contains(['/', '\\']) || name.contains("..") {
            return Err(ColorimeterError::InvalidParameter(format!(
                "archive name '{name}' must not contain path separators"
            )));
        }
        Ok(())
    }

    /// Writes `series` under `name`, replacing any archive of the same name.
    pub fn save(&self, series: &Series, name: &str) -> Result<(), ColorimeterError> {
        Self::validate_name(name)?;
        series.validate()?;
        let path = self.path_for(name);
        let tmp = path.with_extension(format!("{ARCHIVE_EXTENSION}.tmp"));
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, series)
                .map_err(|e| ColorimeterError::ArchiveIo(e.into()))?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Series, ColorimeterError> {
        Self::validate_name(name)?;
        let path = self.path_for(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ColorimeterError::ArchiveNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let series: Series = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            ColorimeterError::ArchiveFormat {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        series
            .validate()
            .map_err(|e| ColorimeterError::ArchiveFormat {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(series)
    }
}

impl AsRef<Path> for SampleStore {
    fn as_ref(&self) -> &Path {
        &self.dir
    }
}
