// Exit Codes
//
// Stable process exit codes. Each fatal error class maps to exactly one
// code so wrappers can react without parsing stderr.
//
//   0  success: input drained and the final state emitted
//   1  internal or i/o error
//   2  invalid or missing configuration (also used by argument errors)
//   3  malformed input line
//   4  record does not fit its schema
//   5  destination column incompatible with the stream
//   6  warehouse write failed after retries
//   7  shutdown grace period elapsed before buffers drained

use bqtarget_kernel::config::ConfigError;
use bqtarget_kernel::error::{ErrorKind, PipelineError};
use bqtarget_kernel::provision::ProvisionError;
use bqtarget_kernel::sync_schema::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    InternalError = 1,
    ConfigError = 2,
    ParseError = 3,
    SchemaError = 4,
    SchemaConflict = 5,
    WriteError = 6,
    Interrupted = 7,
}

impl ExitCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Name used in the final diagnostic line.
    pub fn code_name(self) -> &'static str {
        match self {
            ExitCode::Success => "OK",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::ParseError => "ERR_PARSE",
            ExitCode::SchemaError => "ERR_SCHEMA",
            ExitCode::SchemaConflict => "ERR_SCHEMA_CONFLICT",
            ExitCode::WriteError => "ERR_WRITE",
            ExitCode::Interrupted => "ERR_INTERRUPTED",
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Config => ExitCode::ConfigError,
            ErrorKind::Parse => ExitCode::ParseError,
            ErrorKind::Schema => ExitCode::SchemaError,
            ErrorKind::SchemaConflict => ExitCode::SchemaConflict,
            ErrorKind::Write => ExitCode::WriteError,
            ErrorKind::Interrupted => ExitCode::Interrupted,
            ErrorKind::Io => ExitCode::InternalError,
        }
    }

    /// Classify an error bubbled up to `main`.
    pub fn for_error(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<PipelineError>() {
            return Self::from_kind(e.kind());
        }
        if err.downcast_ref::<ConfigError>().is_some() {
            return ExitCode::ConfigError;
        }
        if let Some(e) = err.downcast_ref::<SyncError>() {
            return match e {
                SyncError::Provision(ProvisionError::SchemaConflict { .. }) => {
                    ExitCode::SchemaConflict
                }
                SyncError::Provision(ProvisionError::Warehouse { .. }) => ExitCode::WriteError,
                SyncError::UnnamedStream { .. } | SyncError::InvalidSchema { .. } => {
                    ExitCode::ParseError
                }
            };
        }
        if let Some(e) = err.downcast_ref::<ProvisionError>() {
            return match e {
                ProvisionError::SchemaConflict { .. } => ExitCode::SchemaConflict,
                ProvisionError::Warehouse { .. } => ExitCode::WriteError,
            };
        }
        if err.downcast_ref::<serde_json::Error>().is_some() {
            return ExitCode::ParseError;
        }
        ExitCode::InternalError
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bqtarget_kernel::warehouse::WarehouseError;
    use bqtarget_kernel::writer::WriteError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ExitCode::Success.as_u8(), 0);
        assert_eq!(ExitCode::ConfigError.as_u8(), 2);
        assert_eq!(ExitCode::WriteError.as_u8(), 6);
        assert_eq!(ExitCode::Interrupted.as_u8(), 7);
    }

    #[test]
    fn errors_are_classified_through_context() {
        let config = anyhow::Error::new(ConfigError::Missing("project_id")).context("loading");
        assert_eq!(ExitCode::for_error(&config), ExitCode::ConfigError);

        let write = anyhow::Error::new(PipelineError::from(WriteError::Timeout {
            table: "p.d.t".into(),
            attempts: 5,
        }));
        assert_eq!(ExitCode::for_error(&write), ExitCode::WriteError);

        let conflict = anyhow::Error::new(SyncError::Provision(ProvisionError::SchemaConflict {
            table: "p.d.t".into(),
            conflicts: vec![],
        }));
        assert_eq!(ExitCode::for_error(&conflict), ExitCode::SchemaConflict);

        let warehouse = anyhow::Error::new(ProvisionError::Warehouse {
            table: "p.d".into(),
            source: WarehouseError::Io("disk".into()),
        });
        assert_eq!(ExitCode::for_error(&warehouse), ExitCode::WriteError);

        assert_eq!(
            ExitCode::for_error(&anyhow::anyhow!("boom")),
            ExitCode::InternalError
        );
    }
}
