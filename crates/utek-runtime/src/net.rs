//! Outbound-network seam.
//!
//! The guard decides whether an operation is allowed; the transport
//! performs it. Real HTTP(S) lives outside this workspace — callers
//! install their own `RemoteTransport`. The simulated default fabricates
//! deterministic successes so programs and tests exercise the policy and
//! accounting paths without sockets.

use anyhow::Result;
use serde_json::{json, Value};

/// Files materialized into the IVFS by a repository fetch:
/// `(relative path, content)` pairs.
pub type FetchedTree = Vec<(String, Vec<u8>)>;

pub trait RemoteTransport: Send + Sync {
    fn fetch_repo(&self, url: &str) -> Result<FetchedTree>;

    fn invoke_remote(&self, endpoint: &str, method: &str, payload: &Value) -> Result<Value>;

    fn push_result(&self, destination: &str, payload: &Value) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct SimulatedTransport;

impl RemoteTransport for SimulatedTransport {
    fn fetch_repo(&self, url: &str) -> Result<FetchedTree> {
        Ok(vec![(
            "README.md".to_string(),
            format!("# fetched from {url}\n").into_bytes(),
        )])
    }

    fn invoke_remote(&self, endpoint: &str, method: &str, payload: &Value) -> Result<Value> {
        Ok(json!({
            "endpoint": endpoint,
            "method": method,
            "echo": payload,
            "simulated": true,
        }))
    }

    fn push_result(&self, _destination: &str, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_fetch_materializes_a_readme() {
        let transport = SimulatedTransport;
        let tree = transport.fetch_repo("https://example.com/repo.git").unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].0, "README.md");
        assert!(String::from_utf8(tree[0].1.clone())
            .unwrap()
            .contains("example.com"));
    }

    #[test]
    fn simulated_invoke_echoes_payload() {
        let transport = SimulatedTransport;
        let out = transport
            .invoke_remote("https://api.example.com", "POST", &json!({"k": 1}))
            .unwrap();
        assert_eq!(out["echo"]["k"], 1);
        assert_eq!(out["simulated"], true);
    }
}
