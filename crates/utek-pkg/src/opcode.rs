//! The closed instruction-set enumeration.
//!
//! Every opcode has exactly one handler in the runtime; anything outside
//! this enum is a fatal decode error. `validate_params` is the decode-time
//! half of the contract: it rejects instructions whose parameter maps are
//! missing required fields or carry the wrong JSON types, so handlers can
//! assume shape.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Params;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // environment / context setup
    SetEnv,
    InitEnv,
    SetContext,
    SyncClock,
    Auth,
    // dependency / resource acquisition
    FetchRepo,
    Checkout,
    Install,
    Unpack,
    Mount,
    Inject,
    Compile,
    // execution / control flow
    Execute,
    Call,
    Ret,
    SpawnThread,
    Wait,
    DelegateTo,
    InvokeRemote,
    Jump,
    Jz,
    Jnz,
    Halt,
    Shutdown,
    // security / crypto
    VerifyHash,
    Verify,
    Sign,
    Encrypt,
    Decrypt,
    LockExec,
    // audit / events
    AuditLog,
    Log,
    EmitEvent,
    // networking
    NetworkUp,
    MapPort,
    PushResult,
    // conditional logic
    If,
    Else,
    Endif,
    Assert,
    // cleanup / export
    Export,
    Cleanup,
    // arithmetic / logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Cmp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpGroup {
    Environment,
    Acquisition,
    Control,
    Crypto,
    Audit,
    Network,
    Conditional,
    Cleanup,
    Alu,
}

impl OpGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            OpGroup::Environment => "environment",
            OpGroup::Acquisition => "acquisition",
            OpGroup::Control => "control",
            OpGroup::Crypto => "crypto",
            OpGroup::Audit => "audit",
            OpGroup::Network => "network",
            OpGroup::Conditional => "conditional",
            OpGroup::Cleanup => "cleanup",
            OpGroup::Alu => "alu",
        }
    }
}

impl Opcode {
    pub const ALL: [Opcode; 54] = [
        Opcode::SetEnv,
        Opcode::InitEnv,
        Opcode::SetContext,
        Opcode::SyncClock,
        Opcode::Auth,
        Opcode::FetchRepo,
        Opcode::Checkout,
        Opcode::Install,
        Opcode::Unpack,
        Opcode::Mount,
        Opcode::Inject,
        Opcode::Compile,
        Opcode::Execute,
        Opcode::Call,
        Opcode::Ret,
        Opcode::SpawnThread,
        Opcode::Wait,
        Opcode::DelegateTo,
        Opcode::InvokeRemote,
        Opcode::Jump,
        Opcode::Jz,
        Opcode::Jnz,
        Opcode::Halt,
        Opcode::Shutdown,
        Opcode::VerifyHash,
        Opcode::Verify,
        Opcode::Sign,
        Opcode::Encrypt,
        Opcode::Decrypt,
        Opcode::LockExec,
        Opcode::AuditLog,
        Opcode::Log,
        Opcode::EmitEvent,
        Opcode::NetworkUp,
        Opcode::MapPort,
        Opcode::PushResult,
        Opcode::If,
        Opcode::Else,
        Opcode::Endif,
        Opcode::Assert,
        Opcode::Export,
        Opcode::Cleanup,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Not,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Cmp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::SetEnv => "SET_ENV",
            Opcode::InitEnv => "INIT_ENV",
            Opcode::SetContext => "SET_CONTEXT",
            Opcode::SyncClock => "SYNC_CLOCK",
            Opcode::Auth => "AUTH",
            Opcode::FetchRepo => "FETCH_REPO",
            Opcode::Checkout => "CHECKOUT",
            Opcode::Install => "INSTALL",
            Opcode::Unpack => "UNPACK",
            Opcode::Mount => "MOUNT",
            Opcode::Inject => "INJECT",
            Opcode::Compile => "COMPILE",
            Opcode::Execute => "EXECUTE",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::SpawnThread => "SPAWN_THREAD",
            Opcode::Wait => "WAIT",
            Opcode::DelegateTo => "DELEGATE_TO",
            Opcode::InvokeRemote => "INVOKE_REMOTE",
            Opcode::Jump => "JUMP",
            Opcode::Jz => "JZ",
            Opcode::Jnz => "JNZ",
            Opcode::Halt => "HALT",
            Opcode::Shutdown => "SHUTDOWN",
            Opcode::VerifyHash => "VERIFY_HASH",
            Opcode::Verify => "VERIFY",
            Opcode::Sign => "SIGN",
            Opcode::Encrypt => "ENCRYPT",
            Opcode::Decrypt => "DECRYPT",
            Opcode::LockExec => "LOCK_EXEC",
            Opcode::AuditLog => "AUDIT_LOG",
            Opcode::Log => "LOG",
            Opcode::EmitEvent => "EMIT_EVENT",
            Opcode::NetworkUp => "NETWORK_UP",
            Opcode::MapPort => "MAP_PORT",
            Opcode::PushResult => "PUSH_RESULT",
            Opcode::If => "IF",
            Opcode::Else => "ELSE",
            Opcode::Endif => "ENDIF",
            Opcode::Assert => "ASSERT",
            Opcode::Export => "EXPORT",
            Opcode::Cleanup => "CLEANUP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::Cmp => "CMP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Opcode::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    pub fn group(self) -> OpGroup {
        use Opcode::*;
        match self {
            SetEnv | InitEnv | SetContext | SyncClock | Auth => OpGroup::Environment,
            FetchRepo | Checkout | Install | Unpack | Mount | Inject | Compile => {
                OpGroup::Acquisition
            }
            Execute | Call | Ret | SpawnThread | Wait | DelegateTo | InvokeRemote | Jump | Jz
            | Jnz | Halt | Shutdown => OpGroup::Control,
            VerifyHash | Verify | Sign | Encrypt | Decrypt | LockExec => OpGroup::Crypto,
            AuditLog | Log | EmitEvent => OpGroup::Audit,
            NetworkUp | MapPort | PushResult => OpGroup::Network,
            If | Else | Endif | Assert => OpGroup::Conditional,
            Export | Cleanup => OpGroup::Cleanup,
            Add | Sub | Mul | Div | Mod | And | Or | Xor | Not | Shl | Shr | Cmp => OpGroup::Alu,
        }
    }

    /// Opcodes that consume a `target_label` resolved through the label map.
    pub fn takes_label_target(self) -> bool {
        matches!(
            self,
            Opcode::Call | Opcode::Jump | Opcode::Jz | Opcode::Jnz | Opcode::SpawnThread
        )
    }

    /// Opcodes whose effects reach beyond pure register/context state
    /// (filesystem writes, networking, subprocesses, shared locks, real
    /// time). These are simulated in dry-run mode.
    pub fn is_effectful(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            FetchRepo
                | Checkout
                | Install
                | Unpack
                | Mount
                | Inject
                | Compile
                | Execute
                | Wait
                | DelegateTo
                | InvokeRemote
                | LockExec
                | NetworkUp
                | MapPort
                | PushResult
                | Export
                | Cleanup
                | Sign
                | Encrypt
                | Decrypt
        )
    }

    /// Decode-time parameter validation.
    pub fn validate_params(self, params: &Params) -> Result<()> {
        use Opcode::*;
        match self {
            SetEnv => {
                if params.is_empty() {
                    anyhow::bail!("SET_ENV requires at least one variable");
                }
                for (k, v) in params {
                    if !is_scalar(v) {
                        anyhow::bail!("SET_ENV value for {k:?} must be a scalar");
                    }
                }
                Ok(())
            }
            InitEnv => {
                optional_str(params, "working_directory")?;
                Ok(())
            }
            SetContext => {
                optional_str(params, "role")?;
                optional_str(params, "namespace")?;
                optional_str(params, "working_directory")?;
                optional_map(params, "resource_limits")?;
                optional_map(params, "security_policy")?;
                Ok(())
            }
            SyncClock | Ret | Else | Endif | LockExec | NetworkUp | Cleanup => Ok(()),
            Auth => require_str(params, "service"),
            FetchRepo => require_str(params, "url"),
            Checkout => require_str(params, "ref"),
            Install => require_str(params, "package"),
            Unpack => {
                require_str(params, "archive_path")?;
                require_str(params, "target_path")
            }
            Mount => {
                require_str(params, "source")?;
                require_str(params, "target")
            }
            Inject => {
                require_str(params, "path")?;
                if optional_str(params, "content")?.is_none()
                    && optional_str(params, "content_b64")?.is_none()
                {
                    anyhow::bail!("INJECT requires content or content_b64");
                }
                Ok(())
            }
            Compile => require_str(params, "source_path"),
            Execute => match params.get("command") {
                Some(Value::String(_)) => Ok(()),
                Some(Value::Array(items)) if !items.is_empty() => {
                    if items.iter().all(|i| i.is_string()) {
                        Ok(())
                    } else {
                        anyhow::bail!("EXECUTE command array must contain only strings")
                    }
                }
                Some(_) => anyhow::bail!("EXECUTE command must be a string or string array"),
                None => anyhow::bail!("EXECUTE requires command"),
            },
            Call | Jump | Jz | Jnz | SpawnThread => require_str(params, "target_label"),
            Wait => {
                if let Some(v) = params.get("duration_seconds") {
                    if !v.is_number() {
                        anyhow::bail!("WAIT duration_seconds must be a number");
                    }
                }
                Ok(())
            }
            DelegateTo => require_str(params, "package_path"),
            InvokeRemote => require_str(params, "endpoint"),
            Halt | Shutdown => Ok(()),
            VerifyHash => {
                require_str(params, "path")?;
                require_str(params, "expected_hash")
            }
            Verify => {
                if optional_str(params, "path")?.is_none() && optional_str(params, "data")?.is_none()
                {
                    anyhow::bail!("VERIFY requires path or data");
                }
                require_str(params, "signature_hex")
            }
            Sign => {
                if optional_str(params, "path")?.is_none() && optional_str(params, "data")?.is_none()
                {
                    anyhow::bail!("SIGN requires path or data");
                }
                Ok(())
            }
            Encrypt | Decrypt => {
                require_str(params, "path")?;
                require_str(params, "key_hex")
            }
            AuditLog | Log => require_str(params, "message"),
            EmitEvent => require_str(params, "event"),
            MapPort => {
                require_u64(params, "host_port")?;
                require_u64(params, "unit_port")
            }
            PushResult => require_str(params, "destination"),
            If | Assert => require_str(params, "condition"),
            Export => require_str(params, "source_path"),
            Add | Sub | Mul | Div | Mod | And | Or | Xor | Shl | Shr => {
                require_u64(params, "dest")?;
                require_operand(params, 1)?;
                require_operand(params, 2)
            }
            Not => {
                require_u64(params, "dest")?;
                require_operand(params, 1)
            }
            Cmp => {
                require_operand(params, 1)?;
                require_operand(params, 2)
            }
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_scalar(v: &Value) -> bool {
    v.is_string() || v.is_number() || v.is_boolean()
}

fn require_str(params: &Params, key: &str) -> Result<()> {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => anyhow::bail!("parameter {key:?} must be non-empty"),
        Some(_) => anyhow::bail!("parameter {key:?} must be a string"),
        None => anyhow::bail!("missing required parameter {key:?}"),
    }
}

fn optional_str<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => anyhow::bail!("parameter {key:?} must be a string"),
        None => Ok(None),
    }
}

fn optional_map(params: &Params, key: &str) -> Result<()> {
    match params.get(key) {
        Some(Value::Object(_)) | None => Ok(()),
        Some(_) => anyhow::bail!("parameter {key:?} must be an object"),
    }
}

fn require_u64(params: &Params, key: &str) -> Result<()> {
    match params.get(key) {
        Some(v) if v.as_u64().is_some() => Ok(()),
        Some(_) => anyhow::bail!("parameter {key:?} must be a non-negative integer"),
        None => anyhow::bail!("missing required parameter {key:?}"),
    }
}

/// ALU operands come as either `srcN` (register index) or `valN` (literal).
fn require_operand(params: &Params, n: u8) -> Result<()> {
    let src = format!("src{n}");
    let val = format!("val{n}");
    match (params.get(src.as_str()), params.get(val.as_str())) {
        (Some(s), None) if s.as_u64().is_some() => Ok(()),
        (Some(_), None) => anyhow::bail!("parameter {src:?} must be a register index"),
        (None, Some(v)) if v.is_number() => Ok(()),
        (None, Some(_)) => anyhow::bail!("parameter {val:?} must be a number"),
        (Some(_), Some(_)) => anyhow::bail!("operand {n} given as both {src:?} and {val:?}"),
        (None, None) => anyhow::bail!("missing operand {n} ({src:?} or {val:?})"),
    }
}
