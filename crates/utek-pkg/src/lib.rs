//! `.asu` program-package model.
//!
//! A package is a header plus an ordered instruction stream, optionally
//! carrying a virtual-filesystem seed tree. Identity is a SHA-256 hash of
//! the canonical (sorted-key, compact, signature-blanked) serialization,
//! so identity is stable across signing and key reordering in the source
//! document.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use utek_contracts::{ASU_PROTOCOL_VERSION, DEFAULT_PROCESSOR_SPEC};
use utek_crypto::CryptoEngine;
use utek_policy::{ExecutionMode, NetworkMode, SecurityFlags};

mod archive;
mod codec;
mod opcode;

pub use archive::{build_tar_bytes, unpack_tar_entries};
pub use codec::{decode_auto, encode, Compression};
pub use opcode::{OpGroup, Opcode};

/// Instruction parameter map. `BTreeMap` keeps canonical serialization
/// sorted without a separate normalization pass.
pub type Params = BTreeMap<String, Value>;

pub const DEFAULT_INSTRUCTION_TIMEOUT_SECONDS: f64 = 30.0;
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_MAX_SIZE: &str = "1GB";
const DEFAULT_MEMORY_PROFILE: &str = "512MiB";

fn default_timeout() -> f64 {
    DEFAULT_INSTRUCTION_TIMEOUT_SECONDS
}

fn default_processor_spec() -> String {
    DEFAULT_PROCESSOR_SPEC.to_string()
}

fn default_protocol_version() -> String {
    ASU_PROTOCOL_VERSION.to_string()
}

fn default_memory_profile() -> String {
    DEFAULT_MEMORY_PROFILE.to_string()
}

fn default_max_size() -> String {
    DEFAULT_MAX_SIZE.to_string()
}

fn default_time_budget() -> String {
    "max-exec-time=60s".to_string()
}

fn default_security_flags() -> String {
    "sandboxed".to_string()
}

fn default_filesystem_scheme() -> String {
    "overlay".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageHeader {
    pub processor_spec: String,
    pub protocol_version: String,
    pub execution_environment: String,
    pub memory_profile: String,
    pub filesystem_scheme: String,
    /// Comma-separated security flag tokens (`utek_policy::SecurityFlag`).
    pub security_flags: String,
    /// `max-exec-time=<seconds>s`; absent means no global time budget.
    pub time_budget: String,
    /// Hex RSA-PSS signature over the canonical content hash; empty when unsigned.
    pub checksum_signature: String,
    pub compression_info: Compression,
    pub build_info: String,
    pub target_platform: String,
    pub execution_mode: ExecutionMode,
    pub networking_mode: NetworkMode,
    /// Decompressed-size ceiling for the package document.
    pub max_size: String,
}

impl Default for PackageHeader {
    fn default() -> Self {
        PackageHeader {
            processor_spec: default_processor_spec(),
            protocol_version: default_protocol_version(),
            execution_environment: String::new(),
            memory_profile: default_memory_profile(),
            filesystem_scheme: default_filesystem_scheme(),
            security_flags: default_security_flags(),
            time_budget: default_time_budget(),
            checksum_signature: String::new(),
            compression_info: Compression::default(),
            build_info: String::new(),
            target_platform: "any".to_string(),
            execution_mode: ExecutionMode::default(),
            networking_mode: NetworkMode::default(),
            max_size: default_max_size(),
        }
    }
}

impl PackageHeader {
    pub fn security_flags(&self) -> SecurityFlags {
        SecurityFlags::parse(&self.security_flags)
    }

    /// Decompressed-size ceiling in bytes; malformed values fall back to 1 GiB.
    pub fn max_size_bytes(&self) -> u64 {
        parse_size_bytes(&self.max_size).unwrap_or(1 << 30)
    }

    /// Memory budget in bytes; malformed values fall back to 512 MiB.
    pub fn memory_bytes(&self) -> u64 {
        parse_size_bytes(&self.memory_profile).unwrap_or(512 << 20)
    }

    /// Global wall-clock budget parsed from `time_budget`, if declared.
    pub fn max_exec_seconds(&self) -> Option<f64> {
        let rest = self.time_budget.split("max-exec-time=").nth(1)?;
        let digits: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        digits.parse().ok()
    }
}

/// `"512MiB"` / `"10MB"` / `"2GB"` / bare byte counts. Decimal and binary
/// suffixes are both read as powers of 1024, matching the format's original
/// loose interpretation.
pub fn parse_size_bytes(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = s.strip_suffix("KIB").or(s.strip_suffix("KB")) {
        (d, 1u64 << 10)
    } else if let Some(d) = s.strip_suffix("MIB").or(s.strip_suffix("MB")) {
        (d, 1u64 << 20)
    } else if let Some(d) = s.strip_suffix("GIB").or(s.strip_suffix("GB")) {
        (d, 1u64 << 30)
    } else {
        (s.as_str(), 1u64)
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(multiplier)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub retry_attempts: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            label: None,
            params: Params::new(),
            timeout_seconds: DEFAULT_INSTRUCTION_TIMEOUT_SECONDS,
            retry_attempts: 0,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

/// On-disk document shape. The body is either a flat instruction list or a
/// structured form separating the main sequence from a VFS seed tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PackageDoc {
    header: PackageHeader,
    body: BodyDoc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BodyDoc {
    Flat(Vec<Instruction>),
    Structured {
        main_sequence: Vec<Instruction>,
        #[serde(default)]
        virtual_fs: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgramPackage {
    pub header: PackageHeader,
    pub instructions: Vec<Instruction>,
    /// VFS seed: nested JSON objects are directories, strings are file
    /// contents. `Null` seeds nothing.
    pub vfs_seed: Value,
}

impl ProgramPackage {
    pub fn new(header: PackageHeader, instructions: Vec<Instruction>) -> Self {
        ProgramPackage {
            header,
            instructions,
            vfs_seed: Value::Null,
        }
    }

    /// Canonical form hashed for identity: signature blanked, sorted keys,
    /// compact separators. `serde_json`'s default map is ordered, so one
    /// round trip through `Value` is a full canonicalization.
    fn canonical_value(&self) -> Result<Value> {
        let mut header = self.header.clone();
        header.checksum_signature = String::new();
        let vfs = if self.vfs_seed.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.vfs_seed.clone()
        };
        Ok(serde_json::json!({
            "header": serde_json::to_value(&header).context("canonicalize header")?,
            "body": serde_json::to_value(&self.instructions).context("canonicalize body")?,
            "virtual_fs": vfs,
        }))
    }

    /// Content-address hash (hex SHA-256 of the canonical serialization).
    pub fn content_hash(&self) -> Result<String> {
        let canonical =
            serde_json::to_string(&self.canonical_value()?).context("serialize canonical form")?;
        Ok(utek_crypto::sha256_hex(canonical.as_bytes()))
    }

    /// Label map, built once per run. Duplicate labels are a load error.
    pub fn build_label_map(&self) -> Result<BTreeMap<String, usize>> {
        let mut map = BTreeMap::new();
        for (index, instr) in self.instructions.iter().enumerate() {
            if let Some(label) = &instr.label {
                if let Some(first) = map.insert(label.clone(), index) {
                    anyhow::bail!(
                        "duplicate label {label:?} at instructions {first} and {index}"
                    );
                }
            }
        }
        Ok(map)
    }

    /// Structural validation: closed-enum opcodes are enforced by serde;
    /// this checks per-opcode parameter shape and label uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.instructions.is_empty() {
            anyhow::bail!("package has no instructions");
        }
        for (index, instr) in self.instructions.iter().enumerate() {
            instr
                .opcode
                .validate_params(&instr.params)
                .with_context(|| format!("instruction {index} ({})", instr.opcode))?;
            if !(instr.timeout_seconds.is_finite() && instr.timeout_seconds > 0.0) {
                anyhow::bail!(
                    "instruction {index} ({}) has non-positive timeout",
                    instr.opcode
                );
            }
        }
        self.build_label_map()?;
        Ok(())
    }

    /// Sign in place: RSA-PSS over the canonical hash's ASCII hex bytes.
    pub fn sign(&mut self, engine: &CryptoEngine) -> Result<()> {
        self.header.checksum_signature = String::new();
        let hash = self.content_hash()?;
        let signature = engine.sign(hash.as_bytes()).context("sign package")?;
        self.header.checksum_signature = hex_of(&signature);
        Ok(())
    }

    pub fn verify_signature(&self, engine: &CryptoEngine) -> Result<bool> {
        if self.header.checksum_signature.is_empty() {
            return Ok(true);
        }
        let signature = utek_crypto::hex_decode(&self.header.checksum_signature)
            .context("decode checksum_signature hex")?;
        let hash = self.content_hash()?;
        engine.verify(hash.as_bytes(), &signature)
    }

    fn to_doc(&self) -> PackageDoc {
        PackageDoc {
            header: self.header.clone(),
            body: BodyDoc::Structured {
                main_sequence: self.instructions.clone(),
                virtual_fs: if self.vfs_seed.is_null() {
                    Value::Object(serde_json::Map::new())
                } else {
                    self.vfs_seed.clone()
                },
            },
        }
    }

    /// Serialize and compress using the header's `compression_info`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json =
            serde_json::to_vec_pretty(&self.to_doc()).context("serialize package document")?;
        codec::encode(&json, self.header.compression_info)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).with_context(|| format!("write: {}", path.display()))
    }

    /// Conventional file name for this package's content.
    pub fn conventional_file_name(&self) -> Result<String> {
        Ok(format!("{}.asu", self.content_hash()?))
    }
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub max_decompressed_bytes: u64,
    /// Engine holding the key that package signatures verify against.
    /// Required whenever a package carries a `checksum_signature`.
    pub verify_engine: Option<CryptoEngine>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            verify_engine: None,
        }
    }
}

#[derive(Debug)]
pub struct LoadedPackage {
    pub package: ProgramPackage,
    pub hash: String,
    /// Non-fatal findings (file-name mismatch, unknown security flags).
    pub warnings: Vec<String>,
}

pub fn from_slice(bytes: &[u8], opts: &LoadOptions) -> Result<LoadedPackage> {
    let json = codec::decode_auto(bytes, opts.max_decompressed_bytes)?;
    let doc: PackageDoc = serde_json::from_slice(&json).context("parse package document")?;
    // The loader's ceiling defends the parse itself; the header's own
    // declared ceiling is enforced once it can be read.
    if json.len() as u64 > doc.header.max_size_bytes() {
        anyhow::bail!(
            "package document of {} bytes exceeds the header max_size of {:?}",
            json.len(),
            doc.header.max_size
        );
    }
    let (instructions, vfs_seed) = match doc.body {
        BodyDoc::Flat(instructions) => (instructions, Value::Null),
        BodyDoc::Structured {
            main_sequence,
            virtual_fs,
        } => (main_sequence, virtual_fs),
    };
    let package = ProgramPackage {
        header: doc.header,
        instructions,
        vfs_seed,
    };
    package.validate()?;

    let mut warnings = Vec::new();
    let flags = package.header.security_flags();
    for unknown in flags.unknown_tokens() {
        warnings.push(format!("unknown security flag {unknown:?} ignored"));
    }

    if !package.header.checksum_signature.is_empty() {
        let engine = opts
            .verify_engine
            .as_ref()
            .context("package is signed but no verification key is configured")?;
        if !package.verify_signature(engine)? {
            anyhow::bail!("package signature verification failed");
        }
    }

    let hash = package.content_hash()?;
    Ok(LoadedPackage {
        package,
        hash,
        warnings,
    })
}

pub fn load_file(path: &Path, opts: &LoadOptions) -> Result<LoadedPackage> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    let mut loaded = from_slice(&bytes, opts)?;
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        if stem != loaded.hash {
            loaded.warnings.push(format!(
                "file name {stem:?} does not match content hash {}",
                loaded.hash
            ));
        }
    }
    Ok(loaded)
}

/// The `create-sample` package: exercises env setup, branching, logging,
/// a VFS write, and an export, then halts.
pub fn sample_package() -> ProgramPackage {
    use serde_json::json;

    let header = PackageHeader {
        execution_environment: "utek".to_string(),
        build_info: "sample".to_string(),
        ..PackageHeader::default()
    };
    let instructions = vec![
        Instruction::new(Opcode::InitEnv).with_param("working_directory", json!("/workspace")),
        Instruction::new(Opcode::SetEnv).with_param("GREETING", json!("hello")),
        Instruction::new(Opcode::If).with_param("condition", json!("env.GREETING == 'hello'")),
        Instruction::new(Opcode::Log).with_param("message", json!("greeting confirmed")),
        Instruction::new(Opcode::Else),
        Instruction::new(Opcode::Log).with_param("message", json!("greeting missing")),
        Instruction::new(Opcode::Endif),
        Instruction::new(Opcode::Inject)
            .with_param("path", json!("/workspace/out.txt"))
            .with_param("content", json!("sample artifact\n")),
        Instruction::new(Opcode::Export).with_param("source_path", json!("/workspace")),
        Instruction::new(Opcode::Halt),
    ];
    let mut package = ProgramPackage::new(header, instructions);
    package.vfs_seed = json!({
        "workspace": {},
        "etc": { "motd": "utek sample\n" }
    });
    package
}
