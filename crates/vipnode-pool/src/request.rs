//! Signed pool requests.
//!
//! Positional params are `[sig, node_id, nonce, ...args]` where `node_id` is
//! the caller's enode ID (hex of the uncompressed secp256k1 public key
//! without its `04` prefix) and `sig` is the hex compact ECDSA signature over
//! SHA-256(method || node_id || nonce || json(args)). `method` is the short
//! name, without [`METHOD_PREFIX`](crate::METHOD_PREFIX).
//!
//! Signing with the Ethereum node's own key means the ID the pool knows a
//! node by is the ID its peers see on the devp2p network.

use secp256k1::{Message, PublicKey, SecretKey, Signature, SECP256K1};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use vipnode_types::{VipnodeError, VipnodeResult};

/// Hex length of an enode ID.
pub const NODE_ID_HEX_LEN: usize = 128;

/// A secp256k1 node key that signs requests.
#[derive(Clone)]
pub struct Signer {
    key: SecretKey,
    node_id: String,
}

impl Signer {
    pub fn new(key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1, &key);
        Self {
            key,
            node_id: enode_id(&public_key),
        }
    }

    /// A fresh random identity.
    pub fn generate() -> Self {
        let (key, _) = SECP256K1.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self::new(key)
    }

    /// Load a hex-encoded 32-byte secret key, the format of a geth or parity
    /// `nodekey` file.
    pub fn from_hex(secret: &str) -> VipnodeResult<Self> {
        let secret = secret.trim();
        let secret = secret.strip_prefix("0x").unwrap_or(secret);
        let bytes = hex::decode(secret)
            .map_err(|e| VipnodeError::Config(format!("invalid key encoding: {e}")))?;
        if bytes.len() != 32 {
            return Err(VipnodeError::Config("key must be 32 bytes".to_string()));
        }
        let key = SecretKey::from_slice(&bytes)
            .map_err(|e| VipnodeError::Config(format!("invalid secp256k1 key: {e}")))?;
        Ok(Self::new(key))
    }

    pub fn to_hex(&self) -> String {
        self.key.to_string()
    }

    /// The enode ID; the identity the pool knows this node by.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn sign(&self, method: &str, nonce: i64, args: &[Value]) -> String {
        let digest = digest(method, &self.node_id, nonce, args);
        let message = Message::from_slice(&digest).expect("SHA-256 digest is 32 bytes");
        hex::encode(SECP256K1.sign(&message, &self.key).serialize_compact())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("node_id", &self.node_id).finish()
    }
}

fn enode_id(public_key: &PublicKey) -> String {
    hex::encode(&public_key.serialize_uncompressed()[1..])
}

fn public_key(node_id: &str) -> Option<PublicKey> {
    let bytes = hex::decode(node_id).ok()?;
    if bytes.len() != NODE_ID_HEX_LEN / 2 {
        return None;
    }
    let mut uncompressed = Vec::with_capacity(65);
    uncompressed.push(0x04);
    uncompressed.extend_from_slice(&bytes);
    PublicKey::from_slice(&uncompressed).ok()
}

fn digest(method: &str, node_id: &str, nonce: i64, args: &[Value]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(node_id.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    // Serializing a Vec<Value> cannot fail.
    hasher.update(serde_json::to_vec(args).unwrap_or_default());
    hasher.finalize().into()
}

/// A request as it travels to the pool.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub sig: String,
    pub node_id: String,
    pub nonce: i64,
    pub args: Vec<Value>,
}

impl SignedRequest {
    pub fn sign(signer: &Signer, method: &str, nonce: i64, args: Vec<Value>) -> Self {
        Self {
            sig: signer.sign(method, nonce, &args),
            node_id: signer.node_id.clone(),
            nonce,
            args,
        }
    }

    pub fn into_params(self) -> Vec<Value> {
        let mut params = Vec::with_capacity(3 + self.args.len());
        params.push(Value::String(self.sig));
        params.push(Value::String(self.node_id));
        params.push(Value::from(self.nonce));
        params.extend(self.args);
        params
    }

    pub fn from_params(params: Vec<Value>) -> VipnodeResult<Self> {
        let mut params = params.into_iter();
        let malformed = |what: &str| VipnodeError::InvalidSignature(format!("malformed request: {what}"));
        let sig = match params.next() {
            Some(Value::String(s)) => s,
            _ => return Err(malformed("missing signature")),
        };
        let node_id = match params.next() {
            Some(Value::String(s)) => s,
            _ => return Err(malformed("missing node ID")),
        };
        let nonce = params
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| malformed("missing nonce"))?;
        Ok(Self {
            sig,
            node_id,
            nonce,
            args: params.collect(),
        })
    }

    /// Check the signature against the claimed node ID.
    pub fn verify(&self, method: &str) -> VipnodeResult<()> {
        let invalid = |why: String| VipnodeError::InvalidSignature(why);
        let key = public_key(&self.node_id)
            .ok_or_else(|| invalid(format!("node ID is not a public key: {}", self.node_id)))?;
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| invalid("signature is not hex".to_string()))?;
        let signature = Signature::from_compact(&sig_bytes).map_err(|e| invalid(e.to_string()))?;
        let digest = digest(method, &self.node_id, self.nonce, &self.args);
        let message = Message::from_slice(&digest).map_err(|e| invalid(e.to_string()))?;
        SECP256K1
            .verify(&message, &signature, &key)
            .map_err(|_| invalid(format!("{method} request from {}", self.node_id)))
    }

    /// Decode positional argument `idx`; missing trailing args decode from `null`.
    pub fn arg<T: DeserializeOwned>(&self, idx: usize) -> VipnodeResult<T> {
        let value = self.args.get(idx).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| VipnodeError::InvalidSignature(format!("malformed argument {idx}: {e}")))
    }
}
