#![forbid(unsafe_code)]

use std::collections::BTreeSet;

/// Label attached to every change set sealed by a commit.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

pub const MAX_LABEL_LEN: usize = 64;

pub fn normalize_label(label: &str) -> Result<String, LabelError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(LabelError::Empty);
    }
    if trimmed.len() > MAX_LABEL_LEN {
        return Err(LabelError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(LabelError::ContainsControl);
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(LabelError::ContainsWhitespace);
    }
    Ok(trimmed.to_lowercase())
}

/// Sorted, deduplicated, lowercased. Blank entries are dropped.
pub fn normalize_labels(labels: &[String]) -> Result<Vec<String>, LabelError> {
    let mut out = BTreeSet::new();
    for label in labels {
        if label.trim().is_empty() {
            continue;
        }
        out.insert(normalize_label(label)?);
    }
    Ok(out.into_iter().collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelError {
    Empty,
    TooLong,
    ContainsWhitespace,
    ContainsControl,
}

impl LabelError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "label must not be empty",
            Self::TooLong => "label is too long",
            Self::ContainsWhitespace => "label must not contain whitespace",
            Self::ContainsControl => "label contains control characters",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sorted_lowercased_and_deduplicated() {
        let labels = vec![
            " Release ".to_string(),
            "checkpoint".to_string(),
            "".to_string(),
            "release".to_string(),
        ];
        assert_eq!(
            normalize_labels(&labels).unwrap(),
            vec!["checkpoint".to_string(), "release".to_string()]
        );
    }

    #[test]
    fn invalid_labels_are_rejected() {
        assert_eq!(normalize_label("  ").unwrap_err(), LabelError::Empty);
        assert_eq!(
            normalize_label("two words").unwrap_err(),
            LabelError::ContainsWhitespace
        );
        assert_eq!(
            normalize_label(&"x".repeat(MAX_LABEL_LEN + 1)).unwrap_err(),
            LabelError::TooLong
        );
    }
}
