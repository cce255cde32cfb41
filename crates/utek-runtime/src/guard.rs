//! Security and resource policy checks.
//!
//! Consulted before EXECUTE, networking instructions, MOUNT, and every
//! IVFS-mutating instruction. All checks are pure over the execution
//! context except the quota increments, which the caller applies on
//! success so that denied operations never consume budget.

use url::Url;

use utek_policy::SecurityFlag;

use crate::context::{ExecutionContext, ALLOWED_HOSTS_ENV};
use crate::fault::Fault;

/// Substrings rejected in EXECUTE commands even when host subprocesses
/// are allowed.
pub const DENY_COMMAND_SUBSTRINGS: &[&str] =
    &["rm -rf", "mkfs", ":(){", "curl | sh", "dd if=", "> /dev/"];

/// Gate for subprocess-style EXECUTE.
pub fn check_execute(ctx: &ExecutionContext, command: &str) -> Result<(), Fault> {
    for denied in DENY_COMMAND_SUBSTRINGS {
        if command.contains(denied) {
            return Err(Fault::PolicyViolation(format!(
                "command contains denied substring {denied:?}"
            )));
        }
    }
    if !ctx.flags.contains(SecurityFlag::AllowHostSubprocess) {
        return Err(Fault::PolicyViolation(
            "host subprocess execution requires the allow-host-subprocess flag".to_string(),
        ));
    }
    if ctx.usage.subprocesses >= ctx.limits.max_subprocesses {
        return Err(Fault::ResourceLimitExceeded(format!(
            "subprocess quota exhausted ({})",
            ctx.limits.max_subprocesses
        )));
    }
    Ok(())
}

/// Gate for any outbound network operation against `endpoint` (a URL or a
/// bare host).
pub fn check_network(ctx: &ExecutionContext, endpoint: &str) -> Result<(), Fault> {
    if ctx.flags.contains(SecurityFlag::NoNetwork) {
        return Err(Fault::PolicyViolation(
            "networking denied by the no-network flag".to_string(),
        ));
    }
    if !ctx.network_mode.allows_outbound() {
        return Err(Fault::PolicyViolation(
            "networking denied in offline mode".to_string(),
        ));
    }
    if ctx.network_mode.requires_allow_list() {
        let host = endpoint_host(endpoint).ok_or_else(|| {
            Fault::PolicyViolation(format!("cannot determine host of {endpoint:?}"))
        })?;
        let allowed = ctx.allowed_hosts();
        if !allowed.iter().any(|a| a == &host) {
            return Err(Fault::PolicyViolation(format!(
                "host {host:?} not present in {ALLOWED_HOSTS_ENV}"
            )));
        }
    }
    if ctx.usage.network_ops >= ctx.limits.max_network_ops {
        return Err(Fault::ResourceLimitExceeded(format!(
            "network operation quota exhausted ({})",
            ctx.limits.max_network_ops
        )));
    }
    Ok(())
}

/// Gate for IVFS mutation adding up to `additional_bytes`.
pub fn check_vfs_write(
    ctx: &ExecutionContext,
    current_bytes: u64,
    additional_bytes: u64,
) -> Result<(), Fault> {
    if ctx.flags.contains(SecurityFlag::VfsReadonly) {
        return Err(Fault::PolicyViolation(
            "VFS is read-only for this run".to_string(),
        ));
    }
    if current_bytes.saturating_add(additional_bytes) > ctx.limits.max_vfs_bytes {
        return Err(Fault::ResourceLimitExceeded(format!(
            "VFS byte quota exhausted ({} + {} > {})",
            current_bytes, additional_bytes, ctx.limits.max_vfs_bytes
        )));
    }
    Ok(())
}

/// Gate for IVFS removal (CLEANUP, remove operations): frees bytes but is
/// still a mutation.
pub fn check_vfs_remove(ctx: &ExecutionContext) -> Result<(), Fault> {
    if ctx.flags.contains(SecurityFlag::VfsReadonly) {
        return Err(Fault::PolicyViolation(
            "VFS is read-only for this run".to_string(),
        ));
    }
    Ok(())
}

/// Gate for MOUNT: binding host paths into the VFS is a host-facing
/// privilege, tied to the same flag as host export.
pub fn check_mount(ctx: &ExecutionContext) -> Result<(), Fault> {
    if ctx.flags.contains(SecurityFlag::VfsReadonly) {
        return Err(Fault::PolicyViolation(
            "VFS is read-only for this run".to_string(),
        ));
    }
    Ok(())
}

/// Gate for EXPORT to a host directory.
pub fn check_host_export(ctx: &ExecutionContext) -> Result<(), Fault> {
    if !ctx.flags.contains(SecurityFlag::AllowHostExport) {
        return Err(Fault::PolicyViolation(
            "host export requires the allow-host-export flag".to_string(),
        ));
    }
    Ok(())
}

fn endpoint_host(endpoint: &str) -> Option<String> {
    if let Ok(url) = Url::parse(endpoint) {
        if let Some(host) = url.host_str() {
            return Some(host.to_string());
        }
    }
    // Bare `host` or `host:port` forms.
    let bare = endpoint.split('/').next()?;
    let host = bare.split(':').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceLimits;
    use utek_pkg::PackageHeader;
    use utek_policy::NetworkMode;

    fn ctx_with(flags: &str, mode: NetworkMode) -> ExecutionContext {
        let header = PackageHeader {
            security_flags: flags.to_string(),
            networking_mode: mode,
            ..PackageHeader::default()
        };
        ExecutionContext::from_header(&header, &ResourceLimits::default())
    }

    #[test]
    fn execute_requires_flag_and_rejects_deny_list() {
        let ctx = ctx_with("sandboxed", NetworkMode::Offline);
        assert!(matches!(
            check_execute(&ctx, "echo hi"),
            Err(Fault::PolicyViolation(_))
        ));

        let ctx = ctx_with("sandboxed,allow-host-subprocess", NetworkMode::Offline);
        assert!(check_execute(&ctx, "echo hi").is_ok());
        assert!(matches!(
            check_execute(&ctx, "rm -rf /"),
            Err(Fault::PolicyViolation(_))
        ));
        assert!(matches!(
            check_execute(&ctx, "dd if=/dev/zero of=/dev/sda"),
            Err(Fault::PolicyViolation(_))
        ));
    }

    #[test]
    fn offline_denies_all_networking() {
        let ctx = ctx_with("sandboxed", NetworkMode::Offline);
        assert!(matches!(
            check_network(&ctx, "https://example.com/repo"),
            Err(Fault::PolicyViolation(_))
        ));
    }

    #[test]
    fn restricted_mode_consults_allow_list() {
        let mut ctx = ctx_with("sandboxed", NetworkMode::RestrictedOutbound);
        assert!(check_network(&ctx, "https://example.com/x").is_err());
        ctx.set_env(ALLOWED_HOSTS_ENV, "example.com");
        assert!(check_network(&ctx, "https://example.com/x").is_ok());
        assert!(check_network(&ctx, "https://evil.example.org/x").is_err());
        assert!(check_network(&ctx, "example.com:8080/path").is_ok());
    }

    #[test]
    fn full_mode_still_meters_quota() {
        let mut ctx = ctx_with("sandboxed", NetworkMode::Full);
        ctx.limits.max_network_ops = 2;
        ctx.usage.network_ops = 2;
        assert!(matches!(
            check_network(&ctx, "https://example.com"),
            Err(Fault::ResourceLimitExceeded(_))
        ));
    }

    #[test]
    fn no_network_flag_beats_full_mode() {
        let ctx = ctx_with("sandboxed,no-network", NetworkMode::Full);
        assert!(matches!(
            check_network(&ctx, "https://example.com"),
            Err(Fault::PolicyViolation(_))
        ));
    }

    #[test]
    fn vfs_writes_respect_readonly_and_quota() {
        let ctx = ctx_with("sandboxed,vfs-readonly", NetworkMode::Offline);
        assert!(matches!(
            check_vfs_write(&ctx, 0, 10),
            Err(Fault::PolicyViolation(_))
        ));

        let mut ctx = ctx_with("sandboxed", NetworkMode::Offline);
        ctx.limits.max_vfs_bytes = 100;
        assert!(check_vfs_write(&ctx, 90, 10).is_ok());
        assert!(matches!(
            check_vfs_write(&ctx, 90, 11),
            Err(Fault::ResourceLimitExceeded(_))
        ));
    }

    #[test]
    fn export_requires_flag() {
        let ctx = ctx_with("sandboxed", NetworkMode::Offline);
        assert!(check_host_export(&ctx).is_err());
        let ctx = ctx_with("sandboxed,allow-host-export", NetworkMode::Offline);
        assert!(check_host_export(&ctx).is_ok());
    }
}
