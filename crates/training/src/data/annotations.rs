use std::{fs, path::Path};

use crate::TrainingError;

const COLUMNS: usize = 6;

/// Validation labels from a whitespace separated annotation table.
///
/// Each row holds six columns (`file tag x0 y0 x1 y1`); only the tag column is
/// kept, in file order. A sample is mapped to its row through the digits of
/// its file name after the four character `val_` prefix.
#[derive(Debug, Clone, Default)]
pub struct ValAnnotations {
    tags: Vec<String>,
}

impl ValAnnotations {
    pub fn parse(content: &str) -> Self {
        let tags = content
            .split_whitespace()
            .enumerate()
            .filter(|(position, _)| position % COLUMNS == 1)
            .map(|(_, word)| word.to_string())
            .collect();
        Self { tags }
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let content = fs::read_to_string(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read validation annotations {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tag(&self, row: usize) -> Option<&str> {
        self.tags.get(row).map(String::as_str)
    }

    /// Class index of `sample_id` within `classes`.
    pub fn label_for(&self, sample_id: &str, classes: &[String]) -> Result<u32, TrainingError> {
        let row = annotation_row(sample_id)?;
        let tag = self.tag(row).ok_or_else(|| {
            TrainingError::label_mapping(format!(
                "sample {sample_id} refers to annotation row {row} but only {} rows exist",
                self.tags.len()
            ))
        })?;
        classes
            .iter()
            .position(|class| class == tag)
            .map(|index| index as u32)
            .ok_or_else(|| {
                TrainingError::label_mapping(format!(
                    "annotation tag '{tag}' of sample {sample_id} is not a training class"
                ))
            })
    }
}

fn annotation_row(sample_id: &str) -> Result<usize, TrainingError> {
    let basename = Path::new(sample_id)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(sample_id);
    let digits: String = basename
        .chars()
        .skip(4)
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<usize>().map_err(|_| {
        TrainingError::label_mapping(format!(
            "sample id '{sample_id}' carries no annotation row number"
        ))
    })
}
