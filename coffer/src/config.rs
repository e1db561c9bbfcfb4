//! Password-derived configuration bootstrap.
//!
//! The store keeps one plaintext-framed JSON blob under the id `"config"`
//! holding the PBKDF2 parameters and three encrypted keys: the master AEAD
//! key every shard key ring hangs off, the HMAC key that signs key ring
//! state, and the routing key that assigns paths to shards. Each key lives
//! in a cell under the password-derived cipher with its own scope tag, so a
//! config blob can never be partially re-pointed at other key material.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use coffer_base::canon::Context;
use coffer_base::{base64, Error, Kind, Result};

use crate::cell::Cell;
use crate::crypto::{derive_key, random_bytes, AeadCipher, Cipher, Verifier, KEY_LEN, MAC_KEY_LEN};
use crate::path::DocPath;
use crate::store::Store;

/// Storage id of the configuration blob.
pub const CONFIG_ID: &str = "config";

/// Supported configuration version.
const VERSION: u32 = 1;

/// Default PBKDF2 iteration count for new stores.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Default number of shards for new stores.
pub const DEFAULT_SHARD_COUNT: u16 = 16;

const SALT_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct ConfigBlob {
    version: u32,
    password: PasswordParams,
    cipher: KeySlot,
    auth: KeySlot,
    shards: ShardParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct PasswordParams {
    salt: String,
    iterations: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeySlot {
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShardParams {
    key: String,
    n: u16,
}

/// Everything the core needs once the password has been checked.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Master cipher: parent of every shard key ring.
    pub master: Arc<dyn Cipher>,
    /// Signs and verifies key ring state.
    pub verifier: Verifier,
    /// Assigns document paths to shard ids.
    pub router: Router,
}

/// Keyed routing of paths onto a fixed set of shard ids.
#[derive(Debug, Clone)]
pub struct Router {
    key: Verifier,
    buckets: u16,
}

impl Router {
    fn new(key: Verifier, buckets: u16) -> Self {
        Self { key, buckets }
    }

    /// The shard id responsible for `path`.
    pub fn route(&self, path: &DocPath) -> String {
        let mac = self.key.sign(path.as_str().as_bytes());
        let head = u64::from_be_bytes(mac[..8].try_into().expect("8 bytes"));
        format!("shard-{:04x}", head % self.buckets as u64)
    }

    /// Number of shards in the id space.
    pub fn buckets(&self) -> u16 {
        self.buckets
    }
}

fn slot_context(scope: &str) -> Context {
    Context::new().with("file", CONFIG_ID).with("scope", scope)
}

/// Open the configuration at `store`, creating it when absent.
///
/// A wrong password surfaces as `Access`; a malformed blob as `Config`.
/// When two clients race to create the config, the loser adopts the
/// winner's blob.
pub async fn open(store: &dyn Store, password: &str) -> Result<Bootstrap> {
    match store.read(CONFIG_ID).await? {
        Some(stored) => parse(&stored.value, password),
        None => {
            tracing::debug!("initialising configuration");
            let (blob, bootstrap) = init(password)?;
            match store.write(CONFIG_ID, &blob, None).await {
                Ok(_) => Ok(bootstrap),
                Err(err) if err.kind() == Kind::Conflict => {
                    let stored = store
                        .read(CONFIG_ID)
                        .await?
                        .ok_or_else(|| Error::Config("configuration vanished".into()))?;
                    parse(&stored.value, password)
                }
                Err(err) => Err(err),
            }
        }
    }
}

fn init(password: &str) -> Result<(String, Bootstrap)> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let derived = derive_key(password, &salt, DEFAULT_ITERATIONS);
    let password_cipher: Arc<dyn Cipher> = Arc::new(AeadCipher::new(*derived));

    let master_key: [u8; KEY_LEN] = random_bytes();
    let auth_key: [u8; MAC_KEY_LEN] = random_bytes();
    let route_key: [u8; MAC_KEY_LEN] = random_bytes();

    let seal = |scope: &str, key: &[u8]| -> Result<String> {
        let mut cell: Cell<String> = Cell::new(password_cipher.clone(), slot_context(scope));
        cell.set(base64::fmt(key));
        Ok(base64::fmt(cell.serialize()?))
    };
    let blob = ConfigBlob {
        version: VERSION,
        password: PasswordParams {
            salt: base64::fmt(salt),
            iterations: DEFAULT_ITERATIONS,
        },
        cipher: KeySlot {
            key: seal("cipher", &master_key)?,
        },
        auth: KeySlot {
            key: seal("auth", &auth_key)?,
        },
        shards: ShardParams {
            key: seal("shards", &route_key)?,
            n: DEFAULT_SHARD_COUNT,
        },
    };
    let text = serde_json::to_string(&blob)
        .map_err(|err| Error::Config(format!("serialising configuration: {err}")))?;
    Ok((
        text,
        Bootstrap {
            master: Arc::new(AeadCipher::new(master_key)),
            verifier: Verifier::new(auth_key),
            router: Router::new(Verifier::new(route_key), DEFAULT_SHARD_COUNT),
        },
    ))
}

fn parse(text: &str, password: &str) -> Result<Bootstrap> {
    let blob: ConfigBlob = serde_json::from_str(text)
        .map_err(|err| Error::Config(format!("configuration blob: {err}")))?;
    if blob.version != VERSION {
        return Err(Error::Config(format!(
            "unsupported configuration version {}",
            blob.version
        )));
    }
    if blob.password.iterations == 0 || blob.shards.n == 0 {
        return Err(Error::Config("degenerate configuration parameters".into()));
    }
    let salt = base64::parse_vec(&blob.password.salt)
        .map_err(|_| Error::Config("malformed salt".into()))?;
    let derived = derive_key(password, &salt, blob.password.iterations);
    let password_cipher: Arc<dyn Cipher> = Arc::new(AeadCipher::new(*derived));

    let unseal = |scope: &str, sealed: &str| -> Result<Vec<u8>> {
        let data = base64::parse_vec(sealed)
            .map_err(|_| Error::Config(format!("malformed {scope} key")))?;
        let mut cell: Cell<String> =
            Cell::from_ciphertext(password_cipher.clone(), slot_context(scope), data);
        let encoded = cell
            .get()
            .map_err(|err| match err {
                // The only way a config cell fails to decrypt is the wrong
                // password-derived key.
                Error::Decrypt(_) => Error::Access("invalid password".into()),
                other => other,
            })?
            .ok_or_else(|| Error::Config(format!("empty {scope} key")))?
            .clone();
        base64::parse_vec(&encoded).map_err(|_| Error::Config(format!("malformed {scope} key")))
    };

    let master_key: [u8; KEY_LEN] = unseal("cipher", &blob.cipher.key)?
        .try_into()
        .map_err(|_| Error::Config("master key length".into()))?;
    let auth_key: [u8; MAC_KEY_LEN] = unseal("auth", &blob.auth.key)?
        .try_into()
        .map_err(|_| Error::Config("auth key length".into()))?;
    let route_key: [u8; MAC_KEY_LEN] = unseal("shards", &blob.shards.key)?
        .try_into()
        .map_err(|_| Error::Config("routing key length".into()))?;

    Ok(Bootstrap {
        master: Arc::new(AeadCipher::new(master_key)),
        verifier: Verifier::new(auth_key),
        router: Router::new(Verifier::new(route_key), blob.shards.n),
    })
}

#[cfg(test)]
mod tests {
    use crate::store::mem::MemStore;

    use super::*;

    #[tokio::test]
    async fn open_creates_then_reopens() {
        let store = MemStore::new();
        let first = open(&store, "hunter2").await.unwrap();
        let second = open(&store, "hunter2").await.unwrap();

        // Both bootstraps decrypt each other's output.
        let ctx = Context::new().with("file", "shard-0001");
        let sealed = first.master.encrypt(b"payload", &ctx).unwrap();
        assert_eq!(second.master.decrypt(&sealed, &ctx).unwrap(), b"payload");

        // Routing is stable across opens.
        let path: DocPath = "/some/doc".parse().unwrap();
        assert_eq!(first.router.route(&path), second.router.route(&path));
    }

    #[tokio::test]
    async fn wrong_password_is_access_denied() {
        let store = MemStore::new();
        open(&store, "correct").await.unwrap();
        assert!(matches!(
            open(&store, "incorrect").await,
            Err(Error::Access(_))
        ));
    }

    #[tokio::test]
    async fn malformed_config_is_config_error() {
        let store = MemStore::new();
        store.write(CONFIG_ID, "not json", None).await.unwrap();
        assert!(matches!(
            open(&store, "pw").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn router_stays_inside_bucket_space() {
        let store = MemStore::new();
        let bootstrap = open(&store, "pw").await.unwrap();
        for i in 0..64 {
            let path: DocPath = format!("/dir/doc-{i}").parse().unwrap();
            let id = bootstrap.router.route(&path);
            let bucket =
                u16::from_str_radix(id.strip_prefix("shard-").unwrap(), 16).unwrap();
            assert!(bucket < bootstrap.router.buckets());
            // Deterministic.
            assert_eq!(bootstrap.router.route(&path), id);
        }
    }
}
