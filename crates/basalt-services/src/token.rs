//! Access Guard — block token verification.
//!
//! A block token binds {pool, block id, permitted modes, expiry} to a
//! password: the BLAKE3 keyed hash of the identifier under the node's
//! token key. When block tokens are disabled node-wide every check passes.
//!
//! On rejection the guard renders ERROR_ACCESS_TOKEN on the connection
//! itself, so callers only propagate the error.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};

use basalt_core::message::{AccessMode, AccessToken, BlockIdentity, BlockOpResponse, TokenIdentifier};
use basalt_core::wire::{Op, Status};

use crate::error::TransferError;
use crate::xceiver::ConnState;

/// Capability check for block tokens.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &AccessToken, block: &BlockIdentity, mode: AccessMode) -> Result<(), String>;
}

/// Mints and verifies block tokens with a single shared key.
pub struct BlockTokenSecretManager {
    key: [u8; 32],
}

impl BlockTokenSecretManager {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Random key. Tokens minted by other nodes will not verify.
    pub fn generate() -> Self {
        Self::new(rand::random())
    }

    /// Key from config; empty means generate.
    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        if hex_key.is_empty() {
            return Ok(Self::generate());
        }
        let bytes = hex::decode(hex_key)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("token key must be 32 bytes, got {}", b.len()))?;
        Ok(Self::new(key))
    }

    pub fn create_token(&self, block: &BlockIdentity, modes: &[AccessMode], ttl: Duration) -> AccessToken {
        let expiry_ms = (SystemTime::now() + ttl)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let identifier = TokenIdentifier {
            pool_id: block.pool_id.clone(),
            block_id: block.block_id,
            modes: modes.to_vec(),
            expiry_ms,
        };
        let password = self.password(&identifier).to_hex().to_string();
        AccessToken {
            identifier,
            password,
        }
    }

    fn password(&self, identifier: &TokenIdentifier) -> blake3::Hash {
        // serde_json emits struct fields in declaration order.
        let bytes = serde_json::to_vec(identifier).unwrap_or_default();
        blake3::keyed_hash(&self.key, &bytes)
    }
}

impl TokenVerifier for BlockTokenSecretManager {
    fn verify(&self, token: &AccessToken, block: &BlockIdentity, mode: AccessMode) -> Result<(), String> {
        let id = &token.identifier;
        let presented = blake3::Hash::from_hex(&token.password)
            .map_err(|_| "malformed token password".to_string())?;
        // blake3::Hash equality is constant-time.
        if presented != self.password(id) {
            return Err("token password does not match".into());
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(u64::MAX);
        if id.expiry_ms < now_ms {
            return Err(format!("token expired at {}", id.expiry_ms));
        }
        if id.pool_id != block.pool_id || id.block_id != block.block_id {
            return Err(format!(
                "token is for {}:blk_{}, not {block}",
                id.pool_id, id.block_id
            ));
        }
        if !id.modes.contains(&mode) {
            return Err(format!("token does not permit {mode:?}"));
        }
        Ok(())
    }
}

/// Node-wide token gate.
#[derive(Clone)]
pub struct AccessGuard {
    enabled: bool,
    verifier: Arc<dyn TokenVerifier>,
}

impl AccessGuard {
    pub fn new(enabled: bool, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { enabled, verifier }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, token: &AccessToken, block: &BlockIdentity, mode: AccessMode) -> Result<(), TransferError> {
        if !self.enabled {
            return Ok(());
        }
        self.verifier
            .verify(token, block, mode)
            .map_err(TransferError::AccessDenied)
    }

    /// Check and, on rejection, write ERROR_ACCESS_TOKEN before returning
    /// the error. Write rejections name `local_addr` as the bad link.
    pub async fn check_and_reply<R, W>(
        &self,
        conn: &mut ConnState<R, W>,
        op: Op,
        token: &AccessToken,
        block: &BlockIdentity,
        mode: AccessMode,
        local_addr: &str,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let Err(err) = self.check(token, block, mode) else {
            return Ok(());
        };
        tracing::warn!(
            op = %op,
            block = %block,
            peer = %conn.peer(),
            error = %err,
            "block token rejected"
        );
        let mut response = BlockOpResponse::new(Status::ErrorAccessToken)
            .with_message(format!("{op} for {block} rejected: {err}"));
        if op == Op::WriteBlock {
            response = response.with_first_bad_link(local_addr);
        }
        conn.respond(&response).await?;
        Err(err)
    }
}
