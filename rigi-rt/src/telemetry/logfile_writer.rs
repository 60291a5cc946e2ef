use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use itertools::Itertools;
use tracing::trace;

/// Size-based rotating log sink: writes to `<name>.log` until `max_bytes`
/// is reached, then renames the file to a timestamped backup and prunes
/// backups beyond `backups`. Wrapped in `tracing_appender::non_blocking`,
/// so writes never stall the caller.
pub(super) struct SizeRotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Option<fs::File>,
    written: u64,
}

impl SizeRotatingWriter {
    pub(super) fn new(directory: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Self {
        Self {
            path: directory.into().join("rigi.log"),
            max_bytes: max_bytes.max(1024),
            backups,
            file: None,
            written: 0,
        }
    }

    fn open(&mut self) -> io::Result<&mut fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.written = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("Just inserted"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        self.written = 0;

        let backup = self.path.with_extension(format!(
            "log.{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        fs::rename(&self.path, backup)?;
        self.prune_backups()
    }

    fn prune_backups(&self) -> io::Result<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        let stale = itertools::process_results(
            fs::read_dir(parent)?.filter_map(|entry| {
                let entry = match entry {
                    Ok(x) => x,
                    Err(e) => return Some(Err(e)),
                };
                let path = entry.path();
                if path == self.path || path.extension().is_none() {
                    return None;
                }
                match entry.metadata().and_then(|m| m.modified()) {
                    Ok(modified) => Some(Ok((modified, path))),
                    Err(e) => Some(Err(e)),
                }
            }),
            |files| {
                files
                    .sorted_by_key(|(modified, _)| *modified)
                    .rev()
                    .skip(self.backups)
                    .collect::<Vec<_>>()
            },
        )?;

        for (_, path) in stale {
            trace!("Deleting log backup '{path:?}'");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.open()?;
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.open()?.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
