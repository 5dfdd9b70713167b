//! Trait implemented by seed sources so different seed lists plug into the frontier.

use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Boxed iterator of seed URIs so sources can yield them one at a time without buffering.
pub type SeedIter<'a> = Box<dyn Iterator<Item = Result<String, Box<dyn Error + Send + Sync>>> + 'a>;

pub trait SeedSource: Send + Sync {
    /// The seeds, read afresh on every call so a source can be reloaded on demand.
    fn seeds(&self) -> SeedIter<'_>;

    /// Human-readable source name so logs identify where seeds came from.
    fn name(&self) -> &'static str;
}

/// One URI per line. Blank lines and `#` comments are skipped; text after the
/// first whitespace on a line is ignored.
pub struct FileSeedSource {
    path: PathBuf,
}

impl FileSeedSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn parse_line(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        line.split_whitespace().next().map(str::to_string)
    }
}

impl SeedSource for FileSeedSource {
    fn seeds(&self) -> SeedIter<'_> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                let err: Box<dyn Error + Send + Sync> =
                    format!("Cannot open seed file {}: {}", self.path.display(), e).into();
                return Box::new(std::iter::once(Err(err)));
            }
        };

        Box::new(
            BufReader::new(file)
                .lines()
                .filter_map(|line| match line {
                    Ok(line) => Self::parse_line(&line).map(Ok),
                    Err(e) => Some(Err(Box::new(e) as Box<dyn Error + Send + Sync>)),
                }),
        )
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Seeds held in memory; handy for tests and embedding.
pub struct StaticSeedSource {
    uris: Vec<String>,
}

impl StaticSeedSource {
    pub fn new<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: uris.into_iter().map(Into::into).collect(),
        }
    }
}

impl SeedSource for StaticSeedSource {
    fn seeds(&self) -> SeedIter<'_> {
        Box::new(self.uris.iter().cloned().map(Ok))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
