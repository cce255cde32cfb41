//! Instruction handlers: the execute stage of the pipeline.
//!
//! Exactly one arm per opcode. Handlers mutate only their own unit's
//! state; the only shared touch-points are the audit sink, the lock set,
//! and the transport, all behind the scheduler-owned handles.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde_json::{json, Value};

use utek_pkg::{Instruction, LoadOptions, Opcode, Params};
use utek_policy::{NetworkMode, SecurityFlag};

use crate::expr;
use crate::fault::Fault;
use crate::guard;
use crate::ivfs;
use crate::regs::Slot;
use crate::unit::{scan_branch, BranchTarget, Effect, ExecutionUnit, MAX_DELEGATION_DEPTH};

const MAX_CAPTURED_OUTPUT: usize = 8 * 1024;
const SUBPROCESS_POLL_MS: u64 = 10;

impl ExecutionUnit {
    pub(crate) fn dispatch(
        &mut self,
        instruction: &Instruction,
        timeout: f64,
    ) -> Result<Effect, Fault> {
        let params = &instruction.params;
        // Dry-run simulates anything whose effects reach beyond pure
        // register/context state; control flow still executes for real so
        // the branch structure stays auditable.
        if self.ctx.execution_mode.is_dry_run() && instruction.opcode.is_effectful() {
            return Ok(Effect::dry_run(format!("{} simulated", instruction.opcode)));
        }
        match instruction.opcode {
            // --- environment / context -----------------------------------
            Opcode::SetEnv => {
                let mut keys = Vec::new();
                for (key, value) in params {
                    let text = scalar_to_string(value)
                        .ok_or_else(|| Fault::Decode(format!("SET_ENV {key:?} is not scalar")))?;
                    self.ctx.set_env(key, &text);
                    keys.push(key.as_str());
                }
                Ok(Effect::ok(format!("set {}", keys.join(","))))
            }
            Opcode::InitEnv => {
                guard::check_vfs_write(&self.ctx, self.vfs.total_bytes(), 0)?;
                for dir in ["/tmp", "/home", "/workspace"] {
                    self.vfs
                        .mkdir_all(dir)
                        .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                }
                if let Some(wd) = str_param(params, "working_directory") {
                    let wd = self.rpath(wd);
                    self.vfs
                        .mkdir_all(&wd)
                        .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                    self.ctx.working_directory = wd;
                }
                Ok(Effect::ok(format!(
                    "environment initialized, cwd {}",
                    self.ctx.working_directory
                )))
            }
            Opcode::SetContext => self.set_context(params),
            Opcode::SyncClock => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                self.ctx.set_env("UTEK_CLOCK_MS", &now_ms.to_string());
                Ok(Effect::ok(format!("clock synchronized at {now_ms}")))
            }
            Opcode::Auth => {
                let service = req_str(params, "service")?;
                let user = params
                    .get("credentials")
                    .and_then(|c| {
                        c.get("user")
                            .or_else(|| c.get("token_value"))
                            .and_then(Value::as_str)
                    })
                    .ok_or_else(|| {
                        Fault::Handler("AUTH requires credentials.user or credentials.token_value".into())
                    })?;
                self.ctx.current_user = Some(user.to_string());
                Ok(Effect::ok(format!("authenticated {user:?} for {service}")))
            }

            // --- acquisition ---------------------------------------------
            Opcode::FetchRepo => {
                let url = req_str(params, "url")?.to_string();
                guard::check_network(&self.ctx, &url)?;
                self.ctx.usage.network_ops += 1;
                let tree = self
                    .shared
                    .transport
                    .fetch_repo(&url)
                    .map_err(|e| Fault::Handler(format!("fetch {url}: {e:#}")))?;
                let target = match str_param(params, "target_path") {
                    Some(path) => self.rpath(path),
                    None => self.rpath(&repo_dir_name(&url)),
                };
                let total: u64 = tree.iter().map(|(_, bytes)| bytes.len() as u64).sum();
                guard::check_vfs_write(&self.ctx, self.vfs.total_bytes(), total)?;
                self.vfs
                    .mkdir_all(&target)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                let count = tree.len();
                for (rel, bytes) in tree {
                    let path = format!("{}/{}", target.trim_end_matches('/'), rel);
                    self.vfs
                        .write_file(&path, &bytes, false)
                        .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                }
                Ok(Effect::ok(format!("fetched {url} -> {target} ({count} files)")))
            }
            Opcode::Checkout => {
                let reference = req_str(params, "ref")?.to_string();
                let repo = match str_param(params, "repo_path") {
                    Some(path) => self.rpath(path),
                    None => self.ctx.working_directory.clone(),
                };
                if !self.vfs.is_dir(&repo) {
                    return Err(Fault::Handler(format!("no such directory: {repo}")));
                }
                self.guarded_write(&format!("{repo}/.ref"), reference.as_bytes(), false)?;
                Ok(Effect::ok(format!("checked out {reference} in {repo}")))
            }
            Opcode::Install => {
                let package = req_str(params, "package")?.to_string();
                self.guarded_write(
                    "/var/lib/utek/installed",
                    format!("{package}\n").as_bytes(),
                    true,
                )?;
                Ok(Effect::ok(format!("recorded install of {package}")))
            }
            Opcode::Unpack => {
                let archive = self.rpath(req_str(params, "archive_path")?);
                let target = self.rpath(req_str(params, "target_path")?);
                let bytes = self
                    .vfs
                    .read_file(&archive)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?
                    .to_vec();
                let decoded = utek_pkg::decode_auto(&bytes, self.ctx.limits.max_vfs_bytes)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                let entries = utek_pkg::unpack_tar_entries(&decoded)
                    .map_err(|e| Fault::Handler(format!("unpack {archive}: {e:#}")))?;
                let total: u64 = entries.iter().map(|(_, b)| b.len() as u64).sum();
                guard::check_vfs_write(&self.ctx, self.vfs.total_bytes(), total)?;
                let count = entries.len();
                for (rel, content) in entries {
                    let path = format!("{}/{}", target.trim_end_matches('/'), rel);
                    self.vfs
                        .write_file(&path, &content, false)
                        .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                }
                Ok(Effect::ok(format!("unpacked {count} entries -> {target}")))
            }
            Opcode::Mount => {
                let source = req_str(params, "source")?.to_string();
                let target = self.rpath(req_str(params, "target")?);
                let writable = bool_param(params, "writable", false);
                guard::check_mount(&self.ctx)?;
                self.vfs
                    .mount(&target, &source, writable)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                Ok(Effect::ok(format!(
                    "mounted {source} -> {target} ({})",
                    if writable { "rw" } else { "ro" }
                )))
            }
            Opcode::Inject => {
                let path = self.rpath(req_str(params, "path")?);
                let append = bool_param(params, "append", false);
                let content = match (str_param(params, "content"), str_param(params, "content_b64"))
                {
                    (Some(text), _) => text.as_bytes().to_vec(),
                    (None, Some(b64)) => base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| Fault::Decode(format!("content_b64: {e}")))?,
                    (None, None) => unreachable!("validated at decode"),
                };
                self.guarded_write(&path, &content, append)?;
                Ok(Effect::ok(format!("injected {} bytes -> {path}", content.len())))
            }
            Opcode::Compile => {
                let source = self.rpath(req_str(params, "source_path")?);
                let output = match str_param(params, "output_path") {
                    Some(path) => self.rpath(path),
                    None => format!("{source}.o"),
                };
                let bytes = self
                    .vfs
                    .read_file(&source)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?
                    .to_vec();
                let digest = utek_crypto::sha256_hex(&bytes);
                let artifact = format!("object({} bytes, sha256 {digest})\n", bytes.len());
                self.guarded_write(&output, artifact.as_bytes(), false)?;
                Ok(Effect::ok(format!("compiled {source} -> {output}")))
            }

            // --- execution / control flow --------------------------------
            Opcode::Execute => self.execute_subprocess(params, timeout),
            Opcode::Call => {
                let label = req_str(params, "target_label")?;
                let target = self.resolve_label(label)?;
                self.regs.push_return(self.regs.pc + 1)?;
                Ok(Effect::jump(target, format!("call {label} -> {target}")))
            }
            Opcode::Ret => {
                let address = self.regs.pop_return()?;
                Ok(Effect::jump(address, format!("return -> {address}")))
            }
            Opcode::SpawnThread => {
                let label = req_str(params, "target_label")?;
                self.resolve_label(label)?;
                self.events.push(json!({ "spawn_thread": label }));
                Ok(Effect::ok(format!("spawn of {label:?} recorded")))
            }
            Opcode::Wait => {
                let requested = f64_param(params, "duration_seconds").unwrap_or(1.0).max(0.0);
                if requested > timeout {
                    std::thread::sleep(Duration::from_secs_f64(timeout));
                    return Err(Fault::Timeout(format!(
                        "WAIT of {requested}s exceeds the {timeout}s budget"
                    )));
                }
                std::thread::sleep(Duration::from_secs_f64(requested));
                Ok(Effect::ok(format!("waited {requested}s")))
            }
            Opcode::DelegateTo => self.delegate_to(params),
            Opcode::InvokeRemote => {
                let endpoint = req_str(params, "endpoint")?.to_string();
                guard::check_network(&self.ctx, &endpoint)?;
                self.ctx.usage.network_ops += 1;
                let method = str_param(params, "method").unwrap_or("POST").to_string();
                let payload = params.get("payload").cloned().unwrap_or(Value::Null);
                let response = self
                    .shared
                    .transport
                    .invoke_remote(&endpoint, &method, &payload)
                    .map_err(|e| Fault::Handler(format!("invoke {endpoint}: {e:#}")))?;
                if let Some(index) = u64_param(params, "result_register") {
                    self.regs
                        .write(index as usize, Slot::Str(response.to_string()))?;
                }
                Ok(Effect::ok(format!("{method} {endpoint}")))
            }
            Opcode::Jump => {
                let label = req_str(params, "target_label")?;
                let target = self.resolve_label(label)?;
                Ok(Effect::jump(target, format!("jump {label} -> {target}")))
            }
            Opcode::Jz => {
                let label = req_str(params, "target_label")?;
                let target = self.resolve_label(label)?;
                if self.regs.flags.zero {
                    Ok(Effect::jump(target, format!("jz taken -> {target}")))
                } else {
                    Ok(Effect::ok("jz not taken"))
                }
            }
            Opcode::Jnz => {
                let label = req_str(params, "target_label")?;
                let target = self.resolve_label(label)?;
                if self.regs.flags.zero {
                    Ok(Effect::ok("jnz not taken"))
                } else {
                    Ok(Effect::jump(target, format!("jnz taken -> {target}")))
                }
            }
            Opcode::Halt => Ok(Effect::halt(
                str_param(params, "reason").unwrap_or("HALT instruction"),
            )),
            Opcode::Shutdown => Ok(Effect::shutdown(
                str_param(params, "reason").unwrap_or("SHUTDOWN instruction"),
            )),

            // --- security / crypto ---------------------------------------
            Opcode::VerifyHash => {
                let path = self.rpath(req_str(params, "path")?);
                let expected = req_str(params, "expected_hash")?;
                let algorithm = str_param(params, "algorithm").unwrap_or("sha256");
                let bytes = self
                    .vfs
                    .read_file(&path)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                let actual = utek_crypto::hash_hex(algorithm, bytes)
                    .map_err(|e| Fault::Decode(format!("{e:#}")))?;
                if actual.eq_ignore_ascii_case(expected) {
                    Ok(Effect::ok(format!("{algorithm} of {path} verified")))
                } else {
                    Err(Fault::AssertionFailure(format!(
                        "{algorithm} mismatch for {path}: expected {expected}, got {actual}"
                    )))
                }
            }
            Opcode::Verify => {
                let data = self.data_or_path(params)?;
                let signature = utek_crypto::hex_decode(req_str(params, "signature_hex")?)
                    .map_err(|e| Fault::Decode(format!("signature_hex: {e:#}")))?;
                let override_key = match str_param(params, "public_key_pem") {
                    Some(pem) => Some(
                        utek_crypto::CryptoEngine::parse_public_key_pem(pem)
                            .map_err(|e| Fault::Decode(format!("public_key_pem: {e:#}")))?,
                    ),
                    None => None,
                };
                let valid = self
                    .crypto
                    .verify_with(override_key.as_ref(), &data, &signature)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                if valid {
                    Ok(Effect::ok("signature verified"))
                } else {
                    Err(Fault::AssertionFailure("signature verification failed".into()))
                }
            }
            Opcode::Sign => {
                let data = self.data_or_path(params)?;
                let output = match (str_param(params, "output_path"), str_param(params, "path")) {
                    (Some(out), _) => self.rpath(out),
                    (None, Some(path)) => format!("{}.sig", self.rpath(path)),
                    (None, None) => {
                        return Err(Fault::Decode("SIGN with inline data requires output_path".into()))
                    }
                };
                let signature = self
                    .crypto
                    .sign(&data)
                    .map_err(|e| Fault::Handler(format!("{e:#}")))?;
                let hex: String = signature.iter().map(|b| format!("{b:02x}")).collect();
                self.guarded_write(&output, hex.as_bytes(), false)?;
                Ok(Effect::ok(format!("signed {} bytes -> {output}", data.len())))
            }
            Opcode::Encrypt | Opcode::Decrypt => self.seal_or_open(instruction.opcode, params),
            Opcode::LockExec => {
                if self.holds_lock {
                    return Ok(Effect::ok("execution lock already held"));
                }
                if !self.shared.locks.lock(&self.program_hash) {
                    return Err(Fault::PolicyViolation(format!(
                        "program hash {} is locked by another run",
                        &self.program_hash[..16.min(self.program_hash.len())]
                    )));
                }
                self.holds_lock = true;
                Ok(Effect::ok("execution lock acquired"))
            }

            // --- audit / events ------------------------------------------
            Opcode::AuditLog => Ok(Effect::ok(req_str(params, "message")?)),
            Opcode::Log => {
                let message = req_str(params, "message")?;
                tracing::info!(unit = self.id(), "{message}");
                Ok(Effect::ok(message))
            }
            Opcode::EmitEvent => {
                let event = req_str(params, "event")?;
                let payload = params.get("payload").cloned().unwrap_or(Value::Null);
                self.events.push(json!({ "event": event, "payload": payload }));
                Ok(Effect::ok(format!("emitted {event:?}")))
            }

            // --- networking ----------------------------------------------
            Opcode::NetworkUp => {
                self.check_network_stack()?;
                self.ctx.set_env("UTEK_NETWORK_UP", "1");
                Ok(Effect::ok("network stack marked up"))
            }
            Opcode::MapPort => {
                self.check_network_stack()?;
                let host_port = u64_param(params, "host_port").unwrap_or(0);
                let unit_port = u64_param(params, "unit_port").unwrap_or(0);
                self.events
                    .push(json!({ "map_port": { "host": host_port, "unit": unit_port } }));
                Ok(Effect::ok(format!("mapped host:{host_port} -> unit:{unit_port}")))
            }
            Opcode::PushResult => {
                let destination = req_str(params, "destination")?.to_string();
                guard::check_network(&self.ctx, &destination)?;
                self.ctx.usage.network_ops += 1;
                let payload = params.get("payload").cloned().unwrap_or_else(|| {
                    json!({ "unit_id": self.id(), "program_hash": self.program_hash })
                });
                self.shared
                    .transport
                    .push_result(&destination, &payload)
                    .map_err(|e| Fault::Handler(format!("push {destination}: {e:#}")))?;
                Ok(Effect::ok(format!("pushed result -> {destination}")))
            }

            // --- conditional logic ---------------------------------------
            Opcode::If => {
                let condition = req_str(params, "condition")?;
                let met = expr::eval_condition(condition, &self.ctx.env, &self.regs)
                    .map_err(|e| Fault::Decode(format!("IF condition {condition:?}: {e}")))?;
                self.regs.flags.last_condition = met;
                if met {
                    self.open_conditionals += 1;
                    Ok(Effect::ok(format!("condition true: {condition}")))
                } else {
                    match scan_branch(&self.program, self.regs.pc, true)? {
                        BranchTarget::Else(index) => {
                            self.open_conditionals += 1;
                            Ok(Effect::skip(
                                index + 1,
                                format!("condition false, taking ELSE branch: {condition}"),
                            ))
                        }
                        BranchTarget::Endif(index) => Ok(Effect::skip(
                            index + 1,
                            format!("condition false, no ELSE: {condition}"),
                        )),
                    }
                }
            }
            Opcode::Else => {
                // Reached only after a true IF branch ran to its ELSE; the
                // frame stays open until the ENDIF we jump to closes it.
                if self.open_conditionals == 0 {
                    return Err(Fault::Decode("ELSE without a matching IF".into()));
                }
                match scan_branch(&self.program, self.regs.pc, false)? {
                    BranchTarget::Endif(index) => {
                        Ok(Effect::skip(index, "IF branch already taken"))
                    }
                    BranchTarget::Else(_) => unreachable!("scan_branch(accept_else=false)"),
                }
            }
            Opcode::Endif => {
                if self.open_conditionals == 0 {
                    return Err(Fault::Decode("ENDIF without a matching IF".into()));
                }
                self.open_conditionals -= 1;
                Ok(Effect::ok("conditional closed"))
            }
            Opcode::Assert => {
                let condition = req_str(params, "condition")?;
                let met = expr::eval_condition(condition, &self.ctx.env, &self.regs)
                    .map_err(|e| Fault::Decode(format!("ASSERT condition {condition:?}: {e}")))?;
                self.regs.flags.last_condition = met;
                if met {
                    Ok(Effect::ok(format!("assertion held: {condition}")))
                } else {
                    let message = str_param(params, "message")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("assertion failed: {condition}"));
                    Err(Fault::AssertionFailure(message))
                }
            }

            // --- cleanup / export ----------------------------------------
            Opcode::Export => self.export(params),
            Opcode::Cleanup => {
                let path = self.rpath(str_param(params, "path").unwrap_or("/tmp"));
                guard::check_vfs_remove(&self.ctx)?;
                if !self.vfs.exists(&path) {
                    return Ok(Effect::ok(format!("nothing to clean at {path}")));
                }
                let result = if self.vfs.is_dir(&path) {
                    self.vfs.remove_dir(&path, true)
                } else {
                    self.vfs.remove_file(&path)
                };
                result.map_err(|e| Fault::Handler(format!("{e:#}")))?;
                Ok(Effect::ok(format!("cleaned {path}")))
            }

            // --- arithmetic / logic --------------------------------------
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Not
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Cmp => self.alu(instruction.opcode, params),
        }
    }

    fn rpath(&self, path: &str) -> String {
        ivfs::resolve(path, &self.ctx.working_directory)
    }

    fn guarded_write(&mut self, path: &str, content: &[u8], append: bool) -> Result<(), Fault> {
        guard::check_vfs_write(&self.ctx, self.vfs.total_bytes(), content.len() as u64)?;
        self.vfs
            .write_file(path, content, append)
            .map_err(|e| Fault::Handler(format!("{e:#}")))
    }

    fn check_network_stack(&self) -> Result<(), Fault> {
        if self.ctx.flags.contains(SecurityFlag::NoNetwork)
            || !self.ctx.network_mode.allows_outbound()
        {
            return Err(Fault::PolicyViolation(
                "network stack unavailable in this mode".into(),
            ));
        }
        Ok(())
    }

    fn data_or_path(&self, params: &Params) -> Result<Vec<u8>, Fault> {
        if let Some(data) = str_param(params, "data") {
            return Ok(data.as_bytes().to_vec());
        }
        let path = self.rpath(req_str(params, "path")?);
        self.vfs
            .read_file(&path)
            .map(<[u8]>::to_vec)
            .map_err(|e| Fault::Handler(format!("{e:#}")))
    }

    fn set_context(&mut self, params: &Params) -> Result<Effect, Fault> {
        if let Some(role) = str_param(params, "role") {
            self.ctx.role = Some(role.to_string());
        }
        if let Some(namespace) = str_param(params, "namespace") {
            self.ctx.namespace = namespace.to_string();
        }
        if let Some(user) = str_param(params, "current_user") {
            self.ctx.current_user = Some(user.to_string());
        }
        if let Some(wd) = str_param(params, "working_directory") {
            let wd = self.rpath(wd);
            if !self.vfs.is_dir(&wd) {
                return Err(Fault::Handler(format!("no such directory: {wd}")));
            }
            self.ctx.working_directory = wd;
        }
        if let Some(Value::Object(limits)) = params.get("resource_limits") {
            let overrides = limits
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.ctx.limits.apply_overrides(&overrides);
        }
        if let Some(Value::Object(policy)) = params.get("security_policy") {
            if let Some(Value::String(mode)) = policy.get("networking_mode") {
                let new_mode = NetworkMode::parse(mode)
                    .ok_or_else(|| Fault::Decode(format!("unknown networking mode {mode:?}")))?;
                if network_rank(new_mode) > network_rank(self.ctx.network_mode) {
                    return Err(Fault::PolicyViolation(
                        "a run may narrow its networking mode, never widen it".into(),
                    ));
                }
                self.ctx.network_mode = new_mode;
            }
            if let Some(Value::String(flags)) = policy.get("security_flags") {
                for token in flags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    match SecurityFlag::parse(token) {
                        Some(
                            flag @ (SecurityFlag::Sandboxed
                            | SecurityFlag::VfsReadonly
                            | SecurityFlag::NoNetwork),
                        ) => self.ctx.flags.insert(flag),
                        Some(_) => {
                            return Err(Fault::PolicyViolation(format!(
                                "flag {token:?} grants privileges and cannot be added mid-run"
                            )))
                        }
                        None => {
                            return Err(Fault::Decode(format!("unknown security flag {token:?}")))
                        }
                    }
                }
            }
        }
        Ok(Effect::ok("context updated"))
    }

    fn execute_subprocess(&mut self, params: &Params, timeout: f64) -> Result<Effect, Fault> {
        let (argv, command_line) = match params.get("command") {
            Some(Value::String(line)) => (
                line.split_whitespace().map(str::to_string).collect::<Vec<_>>(),
                line.clone(),
            ),
            Some(Value::Array(items)) => {
                let argv: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                let line = argv.join(" ");
                (argv, line)
            }
            _ => unreachable!("validated at decode"),
        };
        guard::check_execute(&self.ctx, &command_line)?;
        if argv.is_empty() {
            return Err(Fault::Decode("EXECUTE command is empty".into()));
        }
        self.ctx.usage.subprocesses += 1;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Fault::Handler(format!("spawn {:?}: {e}", argv[0])))?;

        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Fault::Timeout(format!(
                        "command {command_line:?} exceeded {timeout}s"
                    )));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(SUBPROCESS_POLL_MS)),
                Err(e) => return Err(Fault::Handler(format!("wait: {e}"))),
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Fault::Handler(format!("collect output: {e}")))?;
        let code = output.status.code().unwrap_or(-1);
        self.ctx.set_env("UTEK_LAST_EXIT", &code.to_string());
        let stdout = truncate_output(&output.stdout);
        if output.status.success() {
            Ok(Effect::ok(format!("exit 0: {stdout}")))
        } else {
            let stderr = truncate_output(&output.stderr);
            Err(Fault::Handler(format!(
                "command exited with status {code}: {stderr}"
            )))
        }
    }

    fn delegate_to(&mut self, params: &Params) -> Result<Effect, Fault> {
        let path = self.rpath(req_str(params, "package_path")?);
        if self.ctx.delegation_depth >= MAX_DELEGATION_DEPTH {
            return Err(Fault::PolicyViolation(format!(
                "delegation depth limit of {MAX_DELEGATION_DEPTH} reached"
            )));
        }
        let bytes = self
            .vfs
            .read_file(&path)
            .map_err(|e| Fault::Handler(format!("{e:#}")))?
            .to_vec();
        let opts = LoadOptions {
            max_decompressed_bytes: self.ctx.limits.max_vfs_bytes,
            verify_engine: Some(self.crypto.clone()),
        };
        let loaded = utek_pkg::from_slice(&bytes, &opts)
            .map_err(|e| Fault::Handler(format!("load delegated package: {e:#}")))?;

        let mut sub = ExecutionUnit::with_limits(
            self.id(),
            self.shared.clone(),
            self.crypto.clone(),
            self.base_limits().clone(),
        )
        .delegated(self.ctx.delegation_depth + 1);
        let sub_report = sub.run(&loaded.package);
        self.events.push(json!({
            "delegated": loaded.hash,
            "status": sub_report.status.as_str(),
            "instructions": sub_report.instructions_executed,
        }));
        if sub_report.succeeded() {
            Ok(Effect::ok(format!(
                "delegated package {} finished {}",
                &loaded.hash[..16],
                sub_report.status.as_str()
            )))
        } else {
            Err(Fault::Handler(format!(
                "delegated package {} failed",
                &loaded.hash[..16]
            )))
        }
    }

    fn seal_or_open(&mut self, opcode: Opcode, params: &Params) -> Result<Effect, Fault> {
        let path = self.rpath(req_str(params, "path")?);
        let key = parse_key(req_str(params, "key_hex")?)?;
        let aad = str_param(params, "aad").unwrap_or("").as_bytes().to_vec();
        let input = self
            .vfs
            .read_file(&path)
            .map_err(|e| Fault::Handler(format!("{e:#}")))?
            .to_vec();
        let output_path = match str_param(params, "output_path") {
            Some(out) => self.rpath(out),
            None if opcode == Opcode::Encrypt => format!("{path}.enc"),
            None => path
                .strip_suffix(".enc")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{path}.dec")),
        };
        let output = match opcode {
            Opcode::Encrypt => utek_crypto::seal(&key, &input, &aad)
                .map_err(|e| Fault::Handler(format!("{e:#}")))?,
            Opcode::Decrypt => utek_crypto::open(&key, &input, &aad)
                .map_err(|e| Fault::Handler(format!("{e:#}")))?,
            _ => unreachable!(),
        };
        self.guarded_write(&output_path, &output, false)?;
        Ok(Effect::ok(format!(
            "{opcode} {path} -> {output_path} ({} bytes)",
            output.len()
        )))
    }

    fn export(&mut self, params: &Params) -> Result<Effect, Fault> {
        let source = self.rpath(req_str(params, "source_path")?);
        let subtree = self
            .vfs
            .export_subtree(&source)
            .map_err(|e| Fault::Handler(format!("{e:#}")))?;
        match str_param(params, "target") {
            Some(target) => {
                guard::check_host_export(&self.ctx)?;
                write_host_tree(std::path::Path::new(target), &subtree)
                    .map_err(|e| Fault::Handler(format!("host export: {e:#}")))?;
                Ok(Effect::ok(format!("exported {source} -> host {target}")))
            }
            None => {
                self.exports.push(json!({ "path": source, "tree": subtree }));
                Ok(Effect::ok(format!("exported {source} into report")))
            }
        }
    }

    fn alu(&mut self, opcode: Opcode, params: &Params) -> Result<Effect, Fault> {
        if opcode == Opcode::Cmp {
            let left = self.operand_slot(params, 1)?;
            let right = self.operand_slot(params, 2)?;
            let ordering = slot_cmp(&left, &right)?;
            self.regs.set_compare_flags(ordering);
            return Ok(Effect::ok(format!("cmp {left} {right}: {ordering:?}")));
        }

        let dest = u64_param(params, "dest")
            .ok_or_else(|| Fault::Decode("missing dest register".into()))? as usize;
        let a = self.int_operand(params, 1)?;
        let b = if opcode == Opcode::Not {
            0
        } else {
            self.int_operand(params, 2)?
        };

        let (value, carry, overflow) = match opcode {
            Opcode::Add => {
                let (value, overflow) = a.overflowing_add(b);
                let carry = (a as u64).overflowing_add(b as u64).1;
                (value, carry, overflow)
            }
            Opcode::Sub => {
                let (value, overflow) = a.overflowing_sub(b);
                let carry = (a as u64).overflowing_sub(b as u64).1;
                (value, carry, overflow)
            }
            Opcode::Mul => {
                let (value, overflow) = a.overflowing_mul(b);
                (value, overflow, overflow)
            }
            Opcode::Div => match a.checked_div(b) {
                Some(value) => (value, false, false),
                None if b == 0 => {
                    return Err(Fault::Arithmetic("division by zero".into()))
                }
                None => return Err(Fault::Arithmetic("division overflow".into())),
            },
            Opcode::Mod => match a.checked_rem(b) {
                Some(value) => (value, false, false),
                None if b == 0 => {
                    return Err(Fault::Arithmetic("modulo by zero".into()))
                }
                None => return Err(Fault::Arithmetic("modulo overflow".into())),
            },
            Opcode::And => (a & b, false, false),
            Opcode::Or => (a | b, false, false),
            Opcode::Xor => (a ^ b, false, false),
            Opcode::Not => (!a, false, false),
            Opcode::Shl => {
                let shift = shift_amount(b)?;
                let value = a.wrapping_shl(shift);
                (value, false, value.wrapping_shr(shift) != a)
            }
            Opcode::Shr => {
                let shift = shift_amount(b)?;
                (((a as u64) >> shift) as i64, false, false)
            }
            _ => unreachable!(),
        };
        self.regs.write(dest, Slot::Int(value))?;
        self.regs.set_arith_flags(value, carry, overflow);
        Ok(Effect::ok(format!("{opcode} r{dest} = {value}")))
    }

    fn int_operand(&self, params: &Params, n: u8) -> Result<i64, Fault> {
        if let Some(index) = u64_param(params, &format!("src{n}")) {
            let slot = self.regs.read(index as usize)?;
            return slot.as_int().ok_or_else(|| {
                Fault::Arithmetic(format!(
                    "register r{index} holds {} where an int is required",
                    slot.type_name()
                ))
            });
        }
        match params.get(&format!("val{n}")) {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| Fault::Arithmetic(format!("operand {n} is not an integer"))),
            None => Err(Fault::Decode(format!("missing operand {n}"))),
        }
    }

    fn operand_slot(&self, params: &Params, n: u8) -> Result<Slot, Fault> {
        if let Some(index) = u64_param(params, &format!("src{n}")) {
            return Ok(self.regs.read(index as usize)?.clone());
        }
        match params.get(&format!("val{n}")) {
            Some(value) => {
                if let Some(i) = value.as_i64() {
                    Ok(Slot::Int(i))
                } else if let Some(f) = value.as_f64() {
                    Ok(Slot::Float(f))
                } else {
                    Err(Fault::Decode(format!("operand {n} is not a number")))
                }
            }
            None => Err(Fault::Decode(format!("missing operand {n}"))),
        }
    }
}

fn network_rank(mode: NetworkMode) -> u8 {
    match mode {
        NetworkMode::Offline => 0,
        NetworkMode::RestrictedOutbound => 1,
        NetworkMode::Full => 2,
    }
}

fn parse_key(key_hex: &str) -> Result<[u8; 32], Fault> {
    let bytes = utek_crypto::hex_decode(key_hex)
        .map_err(|e| Fault::Decode(format!("key_hex: {e:#}")))?;
    bytes
        .try_into()
        .map_err(|_| Fault::Decode("key_hex must decode to exactly 32 bytes".into()))
}

fn shift_amount(b: i64) -> Result<u32, Fault> {
    if (0..64).contains(&b) {
        Ok(b as u32)
    } else {
        Err(Fault::Arithmetic(format!("shift amount {b} out of range")))
    }
}

fn slot_cmp(left: &Slot, right: &Slot) -> Result<std::cmp::Ordering, Fault> {
    let ordering = match (left, right) {
        (Slot::Int(a), Slot::Int(b)) => a.cmp(b),
        (Slot::Str(a), Slot::Str(b)) => a.cmp(b),
        (Slot::Bool(a), Slot::Bool(b)) => a.cmp(b),
        (a, b) => {
            let (af, bf) = (slot_as_f64(a), slot_as_f64(b));
            match (af, bf) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| Fault::Arithmetic("cannot order NaN".into()))?,
                _ => a.to_string().cmp(&b.to_string()),
            }
        }
    };
    Ok(ordering)
}

fn slot_as_f64(slot: &Slot) -> Option<f64> {
    match slot {
        Slot::Int(v) => Some(*v as f64),
        Slot::Float(v) => Some(*v),
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn req_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, Fault> {
    str_param(params, key)
        .ok_or_else(|| Fault::Decode(format!("missing required parameter {key:?}")))
}

fn bool_param(params: &Params, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn f64_param(params: &Params, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

fn u64_param(params: &Params, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    if trimmed.len() > MAX_CAPTURED_OUTPUT {
        format!("{}...", &trimmed[..MAX_CAPTURED_OUTPUT])
    } else {
        trimmed.to_string()
    }
}

fn repo_dir_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git")
        .to_string()
}

fn write_host_tree(base: &std::path::Path, tree: &Value) -> anyhow::Result<()> {
    use anyhow::Context as _;
    std::fs::create_dir_all(base).with_context(|| format!("create dir: {}", base.display()))?;
    let Value::Object(entries) = tree else {
        anyhow::bail!("export tree root must be a directory");
    };
    for (name, child) in entries {
        let path = base.join(name);
        match child {
            Value::Object(_) => write_host_tree(&path, child)?,
            Value::String(content) => {
                std::fs::write(&path, content.as_bytes())
                    .with_context(|| format!("write: {}", path.display()))?;
            }
            other => anyhow::bail!("unexpected export node for {name:?}: {other}"),
        }
    }
    Ok(())
}
