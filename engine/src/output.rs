use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EngineError;

/// The pseudo-type that selects every open sink at once.
pub const ALL: &str = "all";

#[derive(Debug)]
struct Sink {
    kind: String,
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

/// Where routed writes currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSink {
    /// The caller's primary stream.
    Primary,
    /// Every open sink.
    All,
    /// One sink, by slot.
    One(usize),
}

/// Named output files plus the selector that decides where `#write` and
/// literal content end up.
#[derive(Debug)]
pub struct OutputRouter {
    /// Slot 0 is always the `all` pseudo-type.
    sinks: Vec<Sink>,
    active: ActiveSink,
    max_sinks: usize,
}

impl OutputRouter {
    pub fn new(max_sinks: usize) -> Self {
        OutputRouter {
            sinks: vec![Sink {
                kind: ALL.to_string(),
                file: None,
                path: None,
            }],
            active: ActiveSink::Primary,
            max_sinks,
        }
    }

    pub fn active(&self) -> ActiveSink {
        self.active
    }

    fn slot(&self, kind: &str) -> Option<usize> {
        self.sinks.iter().position(|sink| sink.kind == kind)
    }

    /// `#mhtfile type T`. Registering a type twice is harmless.
    pub fn register_type(&mut self, kind: &str) -> Result<(), EngineError> {
        if self.slot(kind).is_some() {
            return Ok(());
        }
        if self.sinks.len() > self.max_sinks {
            return Err(EngineError::TooManySinks(self.max_sinks));
        }
        debug!(kind, "registered output type");
        self.sinks.push(Sink {
            kind: kind.to_string(),
            file: None,
            path: None,
        });
        Ok(())
    }

    /// `#mhtfile open T filename`. Creates or truncates the file. A sink
    /// that is already open is flushed and replaced.
    pub fn open(&mut self, kind: &str, filename: Option<&Path>) -> Result<(), EngineError> {
        let slot = self
            .slot(kind)
            .ok_or_else(|| EngineError::SinkUnknownType(kind.to_string()))?;
        let path = filename.ok_or(EngineError::SinkFilenameMissing)?;

        let file = File::create(path).map_err(|e| open_error(path, e))?;
        let sink = &mut self.sinks[slot];
        if let Some(mut previous) = sink.file.take() {
            previous.flush()?;
        }
        debug!(kind, path = %path.display(), "opened output file");
        sink.file = Some(BufWriter::new(file));
        sink.path = Some(path.to_path_buf());
        Ok(())
    }

    /// `#file T` or `#file all`.
    pub fn select(&mut self, kind: &str) -> Result<(), EngineError> {
        self.active = if kind == ALL {
            ActiveSink::All
        } else {
            let slot = self
                .slot(kind)
                .ok_or_else(|| EngineError::SinkUnknownType(kind.to_string()))?;
            ActiveSink::One(slot)
        };
        debug!(kind, "selected output");
        Ok(())
    }

    /// `#mhtfile close`: close every sink and go back to the primary stream.
    pub fn close_all(&mut self) -> Result<(), EngineError> {
        let mut result = Ok(());
        for sink in &mut self.sinks {
            if let Some(mut file) = sink.file.take() {
                if let Err(e) = file.flush() {
                    result = result.and(Err(EngineError::Io(e)));
                }
                debug!(kind = %sink.kind, "closed output file");
            }
            sink.path = None;
        }
        self.active = ActiveSink::Primary;
        result
    }

    pub fn has_open_sink(&self) -> bool {
        self.sinks.iter().any(|sink| sink.file.is_some())
    }

    /// Path of the file open for `kind`, if any.
    pub fn path_of(&self, kind: &str) -> Option<&Path> {
        self.slot(kind)
            .and_then(|slot| self.sinks[slot].path.as_deref())
    }

    pub fn write(&mut self, primary: &mut dyn Write, text: &str) -> io::Result<()> {
        match self.active {
            ActiveSink::Primary => primary.write_all(text.as_bytes()),
            ActiveSink::All => {
                for file in self.sinks.iter_mut().filter_map(|s| s.file.as_mut()) {
                    file.write_all(text.as_bytes())?;
                }
                Ok(())
            }
            ActiveSink::One(slot) => match self.sinks.get_mut(slot).and_then(|s| s.file.as_mut()) {
                Some(file) => file.write_all(text.as_bytes()),
                None => Ok(()),
            },
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        for file in self.sinks.iter_mut().filter_map(|s| s.file.as_mut()) {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_error(path: &Path, error: io::Error) -> EngineError {
    let path = path.to_path_buf();
    match error.kind() {
        ErrorKind::StorageFull => EngineError::DiskFull(path),
        ErrorKind::ReadOnlyFilesystem | ErrorKind::PermissionDenied => {
            EngineError::WriteProtected(path)
        }
        _ => EngineError::GeneralIoError {
            path,
            source: error,
        },
    }
}
