use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

const KEY_LENGTH: usize = 64;

#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretLifecycle {
    Retrieved,
    Created,
    Rotated,
}

impl SecretLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretLifecycle::Retrieved => "retrieved",
            SecretLifecycle::Created => "created",
            SecretLifecycle::Rotated => "rotated",
        }
    }
}

pub struct SecretMaterial {
    secret: SecretString,
    lifecycle: SecretLifecycle,
}

impl SecretMaterial {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn lifecycle(&self) -> SecretLifecycle {
        self.lifecycle
    }
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn ensure(&self, account: &str) -> AppResult<SecretMaterial> {
        if let Some(secret) = self.read_secret(account)? {
            debug!(
                target: "secret_vault",
                service = %self.service_name,
                account,
                "loaded secret from secure backend"
            );
            return Ok(SecretMaterial {
                secret,
                lifecycle: SecretLifecycle::Retrieved,
            });
        }
        let secret = generate_key();
        self.write_secret(account, &secret)?;
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "created new secret in secure backend"
        );
        Ok(SecretMaterial {
            secret,
            lifecycle: SecretLifecycle::Created,
        })
    }

    pub fn rotate(&self, account: &str) -> AppResult<SecretMaterial> {
        let secret = generate_key();
        self.write_secret(account, &secret)?;
        warn!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "rotated secret material"
        );
        Ok(SecretMaterial {
            secret,
            lifecycle: SecretLifecycle::Rotated,
        })
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = self.entry(account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = self.entry(account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::from(value))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = self.entry(account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }

    fn entry(&self, account: &str) -> AppResult<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service_name, account)?)
    }
}

fn generate_key() -> SecretString {
    let mut bytes = vec![0_u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    SecretString::from(STANDARD_NO_PAD.encode(bytes))
}
