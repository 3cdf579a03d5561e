//! Source-code bundle creation.
//!
//! The ingest client hands a set of canonicalized source paths to a
//! [`SourceArchiver`]; the default implementation packs them into a zip
//! archive, preserving the absolute directory structure inside.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::SessionError;

pub trait SourceArchiver: Send + Sync {
    /// Pack `sources` into an archive at `dest`. Unreadable entries are
    /// skipped with a warning; the archive itself failing is fatal.
    fn archive(&self, dest: &Path, sources: &BTreeSet<PathBuf>) -> Result<(), SessionError>;
}

pub struct ZipSourceArchiver;

impl SourceArchiver for ZipSourceArchiver {
    fn archive(&self, dest: &Path, sources: &BTreeSet<PathBuf>) -> Result<(), SessionError> {
        let file = File::create(dest)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for path in sources {
            let mut source = match File::open(path) {
                Ok(source) => source,
                Err(err) => {
                    warn!("skipping source file {}: {}", path.display(), err);
                    continue;
                }
            };
            let name = path.to_string_lossy();
            let name = name.strip_prefix('/').unwrap_or(&name);
            zip.start_file(name, options)
                .map_err(|err| archive_error(dest, err))?;
            io::copy(&mut source, &mut zip)?;
        }

        zip.finish().map_err(|err| archive_error(dest, err))?;
        Ok(())
    }
}

fn archive_error(dest: &Path, err: zip::result::ZipError) -> SessionError {
    SessionError::Env(format!(
        "could not create source archive {}: {}",
        dest.display(),
        err
    ))
}
