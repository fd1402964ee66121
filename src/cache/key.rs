//! Deterministic request fingerprints.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{InvokeRequest, OperationKind};

/// Bumped whenever the canonical form changes, so stale shared-tier
/// entries written by older builds stop matching.
const KEY_VERSION: &str = "v1";

/// Fingerprint of `(operation, normalized params, model)`.
///
/// Parameters are canonicalized before hashing (object keys sorted at every
/// depth, no insignificant whitespace), so logically identical requests hash
/// identically however their JSON was ordered. SHA-256 keeps keys stable
/// across processes, which the shared tier relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a request whose model has already been resolved.
    pub fn for_request(request: &InvokeRequest, model: &str) -> Self {
        Self::compute(request.operation, &request.params, model)
    }

    pub fn compute(operation: OperationKind, params: &Value, model: &str) -> Self {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);

        let mut hasher = Sha256::new();
        for part in [KEY_VERSION, operation.as_str(), model, &canonical] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize `value` with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display for Value is compact JSON.
    let _ = write!(out, "{value}");
}
