//! Compose document parser.
//!
//! Turns YAML text into the raw `ComposeFile` shape. Cross-reference checks
//! live in the manifest loader; this layer only rejects documents that cannot
//! describe any application.

use super::types::*;
use crate::error::{ConvoyError, ParseError, ParseErrorKind, Result};
use std::path::Path;
use tracing::{debug, instrument};

/// Parser for compose documents.
pub struct ComposeParser;

impl ComposeParser {
    /// Parse a compose document from a string.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` if:
    /// - The YAML is invalid or has the wrong shape
    /// - No services are defined
    /// - A service has neither `image` nor `build`
    #[instrument(skip(content))]
    pub fn parse(content: &str) -> Result<ComposeFile> {
        debug!("Parsing compose document");

        let compose: ComposeFile = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .unwrap_or_else(|| "document".to_string());
            ParseError::new(ParseErrorKind::Syntax, location, e.to_string())
        })?;

        Self::validate_services(&compose)?;

        Ok(compose)
    }

    /// Parse a compose document from a file path.
    #[instrument]
    pub fn parse_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<ComposeFile> {
        let path = path.as_ref();
        debug!("Reading compose file from {:?}", path);

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::IoError { path: path.to_path_buf(), source: e })?;

        Self::parse(&content)
    }

    /// Validate that services are properly defined.
    fn validate_services(compose: &ComposeFile) -> Result<()> {
        if compose.services.is_empty() {
            return Err(ParseError::new(
                ParseErrorKind::NoServices,
                "services",
                "no services defined",
            )
            .into());
        }

        for (name, service) in compose.services.iter() {
            let has_image = service.image.as_deref().is_some_and(|i| !i.trim().is_empty());
            if !has_image && service.build.is_none() {
                return Err(ParseError::new(
                    ParseErrorKind::MissingImage,
                    name,
                    "service must declare `image` or `build`",
                )
                .into());
            }
        }

        Ok(())
    }
}
