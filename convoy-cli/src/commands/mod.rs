//! CLI command implementations

pub mod compose;

use colored::Colorize;
use convoy_core::ConvoyError;

/// Find the engine error behind a CLI error, if any.
fn convoy_error(err: &anyhow::Error) -> Option<&ConvoyError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ConvoyError>())
}

/// Process exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    convoy_error(err)
        .map(ConvoyError::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

/// Print a failed command's error to stderr.
pub fn report_error(err: &anyhow::Error) {
    match convoy_error(err) {
        Some(ConvoyError::PartialFailure { failures }) => {
            eprintln!("{} {} service(s) failed", "✗".red().bold(), failures.len());
            for failure in failures {
                eprintln!(
                    "  {} {} ({}): {}",
                    "•".dimmed(),
                    failure.service.bold(),
                    failure.state.to_string().red(),
                    failure.reason
                );
            }
        }
        Some(ConvoyError::Cancelled) => {
            eprintln!("{} Interrupted", "⚠".yellow().bold());
        }
        _ => eprintln!("{} {:#}", "✗".red().bold(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use convoy_core::{ParseError, ParseErrorKind};

    #[test]
    fn test_exit_code_through_context() {
        let err: anyhow::Result<()> =
            Err(ConvoyError::from(ParseError::new(ParseErrorKind::UndeclaredVolume, "db", "x")))
                .context("Failed to load compose.yaml");
        assert_eq!(exit_code(&err.unwrap_err()), 2);

        let err: anyhow::Result<()> =
            Err(ConvoyError::CycleDetected { participants: vec!["a".into(), "b".into()] })
                .context("Failed to start project");
        assert_eq!(exit_code(&err.unwrap_err()), 3);
    }

    #[test]
    fn test_unknown_errors_exit_with_one() {
        assert_eq!(exit_code(&anyhow::anyhow!("no compose file found")), 1);
        assert_eq!(exit_code(&anyhow::Error::from(ConvoyError::Cancelled)), 6);
    }
}
