use once_cell::sync::OnceCell;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Client;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{OrchestratorError, Result};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared HTTP client; the timeout of the first caller wins.
pub fn http_client(timeout: Duration) -> Result<&'static Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OrchestratorError::Http(format!("Failed to build HTTP client: {err}")))
    })
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn sha256_hex(value: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(value.as_bytes()))
}
