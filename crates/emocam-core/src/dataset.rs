//! Labeled 48×48 grayscale dataset in `emotion,pixels,Usage` CSV form.
//!
//! Rows are filtered by their split tag (`Training`, `PublicTest`,
//! `PrivateTest`). Malformed rows are counted and skipped.

use crate::buffers::BufferTracker;
use crate::preprocess::{NormalizedTile, TILE_SIZE};
use crate::types::{Emotion, NUM_EMOTIONS};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub label: Emotion,
    /// Row-major 48×48 grayscale pixels.
    pub pixels: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Dataset {
    pub split: String,
    pub samples: Vec<Sample>,
    /// Rows matching the split that could not be parsed.
    pub skipped: usize,
}

impl Dataset {
    /// Load every row tagged `split` from a dataset file.
    pub fn load(path: &Path, split: &str) -> Result<Self, DatasetError> {
        let io_err = |source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mut dataset = Self::from_reader(BufReader::new(file), split).map_err(io_err)?;
        dataset.split = split.to_string();

        tracing::info!(
            path = %path.display(),
            split,
            samples = dataset.samples.len(),
            skipped = dataset.skipped,
            "loaded dataset split"
        );
        Ok(dataset)
    }

    /// Parse rows from any buffered reader. The first line is a header.
    pub fn from_reader<R: BufRead>(reader: R, split: &str) -> std::io::Result<Self> {
        let mut dataset = Self {
            split: split.to_string(),
            ..Self::default()
        };

        for line in reader.lines().skip(1) {
            let line = line?;
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                continue;
            }
            if fields[2] != split {
                continue;
            }
            match parse_sample(fields[0], fields[1]) {
                Some(sample) => dataset.samples.push(sample),
                None => dataset.skipped += 1,
            }
        }

        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Classifier input for sample `index`.
    pub fn tile(&self, index: usize, tracker: &BufferTracker) -> Option<NormalizedTile> {
        let sample = self.samples.get(index)?;
        NormalizedTile::from_gray_pixels(&sample.pixels, tracker)
    }

    /// Number of samples per emotion, in label order.
    pub fn class_counts(&self) -> [usize; NUM_EMOTIONS] {
        let mut counts = [0usize; NUM_EMOTIONS];
        for sample in &self.samples {
            counts[sample.label.index()] += 1;
        }
        counts
    }
}

fn parse_sample(label: &str, pixels: &str) -> Option<Sample> {
    let label = Emotion::from_index(label.parse().ok()?)?;
    let pixels = pixels
        .split_whitespace()
        .map(|p| p.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    (pixels.len() == TILE_SIZE * TILE_SIZE).then_some(Sample { label, pixels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn row(label: &str, value: u8, count: usize, usage: &str) -> String {
        let pixels = vec![value.to_string(); count].join(" ");
        format!("{label},{pixels},{usage}\n")
    }

    fn fixture() -> String {
        let full = TILE_SIZE * TILE_SIZE;
        let mut csv = String::from("emotion,pixels,Usage\n");
        csv += &row("3", 255, full, "Training");
        csv += &row("0", 0, full, "PublicTest");
        csv += &row("6", 128, full, "PublicTest");
        csv += &row("4", 10, full - 1, "PublicTest");
        csv += &row("9", 10, full, "PublicTest");
        csv += "2,not pixels,PublicTest\n";
        csv += "truncated row\n";
        csv += &row("5", 20, full, "PrivateTest");
        csv
    }

    #[test]
    fn test_filters_by_split() {
        let training = Dataset::from_reader(Cursor::new(fixture()), "Training").unwrap();
        assert_eq!(training.len(), 1);
        assert_eq!(training.samples[0].label, Emotion::Happy);

        let private = Dataset::from_reader(Cursor::new(fixture()), "PrivateTest").unwrap();
        assert_eq!(private.len(), 1);
        assert_eq!(private.samples[0].label, Emotion::Surprise);
    }

    #[test]
    fn test_skips_malformed_rows() {
        let test = Dataset::from_reader(Cursor::new(fixture()), "PublicTest").unwrap();
        assert_eq!(test.len(), 2);
        assert_eq!(test.skipped, 3);
        let counts = test.class_counts();
        assert_eq!(counts[Emotion::Angry.index()], 1);
        assert_eq!(counts[Emotion::Neutral.index()], 1);
    }

    #[test]
    fn test_header_only() {
        let empty = Dataset::from_reader(Cursor::new("emotion,pixels,Usage\n"), "Training").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_tile_scaling() {
        let test = Dataset::from_reader(Cursor::new(fixture()), "PublicTest").unwrap();
        let tracker = BufferTracker::new();
        let tile = test.tile(1, &tracker).unwrap();
        assert!(tile.values().all(|v| (v - 128.0 / 255.0).abs() < 1e-6));
        assert!(test.tile(5, &tracker).is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = Dataset::load(Path::new("/nonexistent/fer2013.csv"), "Training").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fer2013.csv"));
    }
}
