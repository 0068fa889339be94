use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// File that only appears at its path once fully written.
///
/// Data goes into a temporary sibling file which is renamed over the
/// target path by [`OutputFile::commit`].
/// Dropping uncommitted output removes the temporary file,
/// so a failed build never leaves a truncated file behind.
pub struct OutputFile {
    file: Option<BufWriter<File>>,
    temp: PathBuf,
    path: PathBuf,
}

impl OutputFile {
    pub fn create(path: &Path) -> io::Result<Self> {
        let temp = temporary_path(path);
        let file = File::create(&temp)?;

        Ok(OutputFile {
            file: Some(BufWriter::new(file)),
            temp,
            path: path.to_owned(),
        })
    }

    /// Final path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes written data and moves the file into place.
    pub fn commit(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            let file = file.into_inner().map_err(io::IntoInnerError::into_error)?;
            file.sync_all()?;
        }

        std::fs::rename(&self.temp, &self.path)?;
        tracing::debug!("Committed '{}'", self.path.display());
        Ok(())
    }

    fn file(&mut self) -> &mut BufWriter<File> {
        self.file
            .as_mut()
            .expect("Output file is only taken on commit")
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if self.file.take().is_none() && !self.temp.exists() {
            return;
        }

        if let Err(err) = std::fs::remove_file(&self.temp) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    "Failed to remove temporary file '{}'. {:#}",
                    self.temp.display(),
                    err
                );
            }
        }
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file().flush()
    }
}

impl Seek for OutputFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file().seek(pos)
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}
