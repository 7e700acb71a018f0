use std::fmt;
use std::path::Path;

use lazy_regex::regex_captures;
use thiserror::Error;
use unchained_common::padded_block_id;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("file name {0:?} does not encode a block range")]
    Unrecognized(String),
    #[error("file name {name:?} has a range that ends ({last}) before it starts ({first})")]
    Inverted { name: String, first: u64, last: u64 },
}

/// An inclusive range of blocks, as encoded in an index file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileRange {
    pub first: u64,
    pub last: u64,
}

impl FileRange {
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// Parses `<first>-<last>.<ext>` or `<block>.<ext>` from the final path
    /// component.
    pub fn from_filename(path: &Path) -> Result<Self, RangeError> {
        let name = path
            .file_name()
            .and_then(|it| it.to_str())
            .unwrap_or_default();
        let (_, first, last, _ext) = regex_captures!(r"^(\d+)(?:-(\d+))?\.([A-Za-z]+)$", name)
            .ok_or_else(|| RangeError::Unrecognized(name.to_string()))?;
        let parse = |digits: &str| {
            digits
                .parse::<u64>()
                .map_err(|_| RangeError::Unrecognized(name.to_string()))
        };
        let first = parse(first)?;
        let last = match last {
            "" => first,
            digits => parse(digits)?,
        };
        if last < first {
            return Err(RangeError::Inverted {
                name: name.to_string(),
                first,
                last,
            });
        }
        Ok(Self { first, last })
    }

    /// `<first>-<last>.<extension>`, both zero-padded.
    pub fn to_filename(&self, extension: &str) -> String {
        format!("{self}.{extension}")
    }

    pub fn contains(&self, block_number: u64) -> bool {
        (self.first..=self.last).contains(&block_number)
    }

    pub fn block_count(&self) -> u64 {
        self.last - self.first + 1
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            padded_block_id(self.first),
            padded_block_id(self.last)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_sided_ranges() {
        assert_eq!(
            FileRange::from_filename(Path::new("/x/finalized/013000000-013000123.bin")),
            Ok(FileRange::new(13_000_000, 13_000_123))
        );
    }

    #[test]
    fn parses_single_block_names() {
        assert_eq!(
            FileRange::from_filename(Path::new("ripe/015000001.txt")),
            Ok(FileRange::new(15_000_001, 15_000_001))
        );
    }

    #[test]
    fn rejects_junk() {
        for name in ["readme.md", "0001-.bin", "abc-def.bin", ".bin", "00001-00002"] {
            assert!(
                FileRange::from_filename(Path::new(name)).is_err(),
                "{name} should not parse"
            );
        }
    }

    #[test]
    fn rejects_inverted_ranges() {
        assert!(matches!(
            FileRange::from_filename(Path::new("000000010-000000001.bin")),
            Err(RangeError::Inverted { .. })
        ));
    }

    #[test]
    fn filename_round_trip() {
        let range = FileRange::new(1, 250_000);
        let name = range.to_filename("bloom");
        assert_eq!(name, "000000001-000250000.bloom");
        assert_eq!(FileRange::from_filename(Path::new(&name)), Ok(range));
        assert_eq!(range.block_count(), 250_000);
        assert!(range.contains(250_000) && !range.contains(0));
    }
}
