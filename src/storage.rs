//! Credential Storage Module
//!
//! Persists the session token pair. On Windows the blob is protected with
//! DPAPI; other platforms rely on the per-user data directory permissions.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;
#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};

pub use crate::error::StorageError;
use crate::model::SessionToken;

const SESSION_KEY: &str = "session";

/// Secret-backed persistence for the token pair
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<SessionToken>, StorageError>;
    fn set(&self, token: &SessionToken) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// Encrypted file storage (DPAPI on Windows)
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    pub fn new(storage_path: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    /// Save data securely
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json =
            serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let encrypted = self.encrypt(&json)?;

        // Write-then-rename so a crash never leaves a truncated blob behind
        let file_path = self.file_path(key);
        let tmp_path = file_path.with_extension("dat.tmp");
        std::fs::write(&tmp_path, encrypted).map_err(|e| StorageError::Io(e.to_string()))?;
        restrict_permissions(&tmp_path);
        std::fs::rename(&tmp_path, &file_path).map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Saved encrypted data for key: {}", key);
        Ok(())
    }

    /// Load data, `None` when nothing is stored under `key`
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let file_path = self.file_path(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let encrypted = std::fs::read(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
        let decrypted = self.decrypt(&encrypted)?;

        serde_json::from_slice(&decrypted)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.file_path(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(decrypted)
        }
    }

    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        debug!("Could not restrict permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) {}

impl CredentialStore for SecureStorage {
    fn get(&self) -> Result<Option<SessionToken>, StorageError> {
        self.load(SESSION_KEY)
    }

    fn set(&self, token: &SessionToken) -> Result<(), StorageError> {
        self.save(SESSION_KEY, token)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.delete(SESSION_KEY)
    }
}

/// In-process credential store, used when nothing should touch disk
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<SessionToken>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: SessionToken) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<SessionToken>, StorageError> {
        let guard = self
            .token
            .lock()
            .map_err(|_| StorageError::Io("credential store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn set(&self, token: &SessionToken) -> Result<(), StorageError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| StorageError::Io("credential store lock poisoned".into()))?;
        *guard = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| StorageError::Io("credential store lock poisoned".into()))?;
        *guard = None;
        Ok(())
    }
}
