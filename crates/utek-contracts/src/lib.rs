//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings
//! that appear in machine-readable I/O: package documents, run reports, audit
//! lines, and policy snapshots.

pub const ASU_PACKAGE_SCHEMA_VERSION: &str = "utek.asu-package@0.1.0";
pub const ASU_PROTOCOL_VERSION: &str = "v1.0.4";

pub const UTEK_RUN_REPORT_SCHEMA_VERSION: &str = "utek.run.report@0.1.0";
pub const UTEK_STATUS_REPORT_SCHEMA_VERSION: &str = "utek.status.report@0.1.0";
pub const UTEK_VALIDATE_REPORT_SCHEMA_VERSION: &str = "utek.validate.report@0.1.0";

pub const UTEK_AUDIT_LINE_SCHEMA_VERSION: &str = "utek.audit.line@0.1.0";

/// `processor_spec` value emitted into generated headers.
pub const DEFAULT_PROCESSOR_SPEC: &str = "utek-unit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_versions_are_well_formed() {
        for v in [
            ASU_PACKAGE_SCHEMA_VERSION,
            UTEK_RUN_REPORT_SCHEMA_VERSION,
            UTEK_STATUS_REPORT_SCHEMA_VERSION,
            UTEK_VALIDATE_REPORT_SCHEMA_VERSION,
            UTEK_AUDIT_LINE_SCHEMA_VERSION,
        ] {
            let (name, version) = v.split_once('@').expect("schema id has '@'");
            assert!(!name.is_empty());
            assert_eq!(version.split('.').count(), 3, "semver triple: {v}");
        }
    }
}
