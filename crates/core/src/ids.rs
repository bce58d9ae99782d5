#![forbid(unsafe_code)]

pub const MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentifierError {
    Empty { field: &'static str },
    TooLong { field: &'static str },
    ContainsControl { field: &'static str },
}

impl IdentifierError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "identifier must not be empty",
            Self::TooLong { .. } => "identifier is too long",
            Self::ContainsControl { .. } => "identifier contains control characters",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            Self::Empty { field } | Self::TooLong { field } | Self::ContainsControl { field } => {
                field
            }
        }
    }
}

/// Trims and validates a free-form identifier (entity ids, schema keys, plugin keys).
pub fn canonical_identifier(field: &'static str, value: &str) -> Result<String, IdentifierError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IdentifierError::Empty { field });
    }
    if trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong { field });
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(IdentifierError::ContainsControl { field });
    }
    Ok(trimmed.to_string())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionName(String);

impl VersionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, VersionNameError> {
        let value = value.into();
        validate_version_name(&value)?;
        Ok(Self(value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionNameError {
    Empty,
    TooLong,
    InvalidFirstChar,
    InvalidChar { ch: char, index: usize },
}

impl VersionNameError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "version name must not be empty",
            Self::TooLong => "version name is too long",
            Self::InvalidFirstChar => "version name must start with an ascii letter or digit",
            Self::InvalidChar { .. } => "version name contains an unsupported character",
        }
    }
}

fn validate_version_name(value: &str) -> Result<(), VersionNameError> {
    if value.is_empty() {
        return Err(VersionNameError::Empty);
    }
    if value.len() > 128 {
        return Err(VersionNameError::TooLong);
    }
    let Some(first) = value.chars().next() else {
        return Err(VersionNameError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(VersionNameError::InvalidFirstChar);
    }
    for (index, ch) in value.chars().enumerate().skip(1) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
            continue;
        }
        return Err(VersionNameError::InvalidChar { ch, index });
    }
    Ok(())
}

/// Absolute, normalized path of a tracked file (`/docs/readme.md`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilePath(String);

impl FilePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, FilePathError> {
        let value = value.into();
        validate_file_path(&value)?;
        Ok(Self(value))
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilePathError {
    NotAbsolute,
    TrailingSlash,
    EmptySegment,
    RelativeSegment,
    ContainsControl,
}

impl FilePathError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NotAbsolute => "file path must start with '/'",
            Self::TrailingSlash => "file path must not end with '/'",
            Self::EmptySegment => "file path must not contain empty segments",
            Self::RelativeSegment => "file path must not contain '.' or '..' segments",
            Self::ContainsControl => "file path contains control characters",
        }
    }
}

fn validate_file_path(value: &str) -> Result<(), FilePathError> {
    let Some(rest) = value.strip_prefix('/') else {
        return Err(FilePathError::NotAbsolute);
    };
    if rest.is_empty() || rest.ends_with('/') {
        return Err(FilePathError::TrailingSlash);
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(FilePathError::ContainsControl);
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(FilePathError::EmptySegment);
        }
        if segment == "." || segment == ".." {
            return Err(FilePathError::RelativeSegment);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_identifier_trims_and_rejects_control() {
        assert_eq!(canonical_identifier("entity_id", "  e1 ").unwrap(), "e1");
        assert_eq!(
            canonical_identifier("entity_id", "   ").unwrap_err(),
            IdentifierError::Empty { field: "entity_id" }
        );
        assert_eq!(
            canonical_identifier("schema_key", "a\u{0007}b").unwrap_err(),
            IdentifierError::ContainsControl { field: "schema_key" }
        );
    }

    #[test]
    fn version_name_validation() {
        assert!(VersionName::try_new("feature/x-1").is_ok());
        assert_eq!(
            VersionName::try_new("-bad").unwrap_err(),
            VersionNameError::InvalidFirstChar
        );
        assert_eq!(
            VersionName::try_new("a b").unwrap_err(),
            VersionNameError::InvalidChar { ch: ' ', index: 1 }
        );
    }

    #[test]
    fn file_path_validation() {
        assert_eq!(FilePath::try_new("/a/b.json").unwrap().file_name(), "b.json");
        assert_eq!(
            FilePath::try_new("a.json").unwrap_err(),
            FilePathError::NotAbsolute
        );
        assert_eq!(
            FilePath::try_new("/a//b").unwrap_err(),
            FilePathError::EmptySegment
        );
        assert_eq!(
            FilePath::try_new("/a/../b").unwrap_err(),
            FilePathError::RelativeSegment
        );
        assert_eq!(
            FilePath::try_new("/dir/").unwrap_err(),
            FilePathError::TrailingSlash
        );
    }
}
