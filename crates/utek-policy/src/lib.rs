//! Shared policy registries.
//!
//! This crate exists so both:
//! - the package loader (which reads header fields)
//! - the runtime (which enforces them)
//!
//! agree on the closed set of networking modes, execution modes, and
//! security flags, and on the capabilities each one implies.

use serde::{Deserialize, Serialize};

/// Outbound-network posture of a program package.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "clap", clap(rename_all = "kebab_case"))]
pub enum NetworkMode {
    #[default]
    Offline,
    RestrictedOutbound,
    Full,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Offline => "offline",
            NetworkMode::RestrictedOutbound => "restricted-outbound",
            NetworkMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "offline" | "isolated" => Some(NetworkMode::Offline),
            "restricted-outbound" | "restricted" => Some(NetworkMode::RestrictedOutbound),
            "full" => Some(NetworkMode::Full),
            _ => None,
        }
    }

    /// True if any outbound operation can ever be permitted in this mode.
    pub fn allows_outbound(self) -> bool {
        !matches!(self, NetworkMode::Offline)
    }

    /// True if permitted hosts are restricted to an allow-list.
    pub fn requires_allow_list(self) -> bool {
        matches!(self, NetworkMode::RestrictedOutbound)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "clap", clap(rename_all = "kebab_case"))]
pub enum ExecutionMode {
    #[default]
    Batch,
    DryRun,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Batch => "batch",
            ExecutionMode::DryRun => "dry-run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "batch" => Some(ExecutionMode::Batch),
            "dry-run" => Some(ExecutionMode::DryRun),
            _ => None,
        }
    }

    pub fn is_dry_run(self) -> bool {
        matches!(self, ExecutionMode::DryRun)
    }
}

/// One token of a header's comma-separated `security_flags` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecurityFlag {
    Sandboxed,
    VfsReadonly,
    NoNetwork,
    AllowHostSubprocess,
    AllowHostExport,
}

impl SecurityFlag {
    pub const ALL: [SecurityFlag; 5] = [
        SecurityFlag::Sandboxed,
        SecurityFlag::VfsReadonly,
        SecurityFlag::NoNetwork,
        SecurityFlag::AllowHostSubprocess,
        SecurityFlag::AllowHostExport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityFlag::Sandboxed => "sandboxed",
            SecurityFlag::VfsReadonly => "vfs-readonly",
            SecurityFlag::NoNetwork => "no-network",
            SecurityFlag::AllowHostSubprocess => "allow-host-subprocess",
            SecurityFlag::AllowHostExport => "allow-host-export",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "sandboxed" => Some(SecurityFlag::Sandboxed),
            "vfs-readonly" | "readonly" => Some(SecurityFlag::VfsReadonly),
            "no-network" => Some(SecurityFlag::NoNetwork),
            "allow-host-subprocess" => Some(SecurityFlag::AllowHostSubprocess),
            "allow-host-export" => Some(SecurityFlag::AllowHostExport),
            _ => None,
        }
    }
}

/// Parsed form of a header's `security_flags` field.
///
/// Unknown tokens are preserved so the loader can warn about them without
/// this crate growing an error type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityFlags {
    flags: Vec<SecurityFlag>,
    unknown: Vec<String>,
}

impl SecurityFlags {
    pub fn parse(field: &str) -> Self {
        let mut flags = Vec::new();
        let mut unknown = Vec::new();
        for tok in field.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            match SecurityFlag::parse(tok) {
                Some(f) => {
                    if !flags.contains(&f) {
                        flags.push(f);
                    }
                }
                None => unknown.push(tok.to_string()),
            }
        }
        SecurityFlags { flags, unknown }
    }

    pub fn contains(&self, flag: SecurityFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn insert(&mut self, flag: SecurityFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    pub fn unknown_tokens(&self) -> &[String] {
        &self.unknown
    }

    pub fn to_field(&self) -> String {
        self.flags
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}
