//! Seed & key computation for protected targets
//!
//! Keys either come from a vendor library loaded at unlock time, or, for targets that
//! only check that an UNLOCK happens at all, are simulated as all zeros.
//!
//! The library entry points follow the ASAP1A conventions:
//! * CCP - `ASAP1A_CCP_ComputeKeyFromSeed(seed, seed_len, key, max_key_len, *key_len)`,
//!   non zero return means success
//! * XCP - `XCP_ComputeKeyFromSeed(privilege, seed_len, seed, *key_len, key)`,
//!   0 means success

use std::fmt::Debug;

use crate::config::Protocol;

/// Longest CCP key, it has to fit into one UNLOCK frame
pub const CCP_MAX_KEY: usize = 6;
/// Longest XCP seed and key
pub const XCP_MAX_KEY: usize = 255;

/// Seed & key result
pub type SeedKeyResult<T> = Result<T, SeedKeyError>;

#[derive(Debug, thiserror::Error)]
/// Seed & key errors
pub enum SeedKeyError {
    /// Library could not be loaded or lacks the entry point
    #[cfg(feature = "seed-key-dll")]
    #[error("cannot load seed & key library")]
    LibLoadError(
        #[from]
        #[source]
        libloading::Error,
    ),
    /// Connection has no seed & key configured
    #[error("no seed & key computation configured")]
    NotConfigured,
    /// Crate was built without library support
    #[error("seed & key libraries are not supported by this build")]
    NotAvailable,
    /// CCP library returned 0
    #[error("seed & key function returned 0")]
    CcpRejected,
    /// XCP library refused the privilege
    #[error("the requested privilege can not be unlocked with this library")]
    PrivilegeNotSupported,
    /// XCP library refused the seed length
    #[error("the seed length is wrong, key could not be computed")]
    WrongSeedLength,
    /// XCP library needs more key space
    #[error("the space for the key is too small")]
    KeyBufferTooSmall,
    /// XCP library returned an undocumented code
    #[error("unknown error {0}")]
    Unknown(u64),
}

/// Computes the key for a seed
pub trait SeedKey: Send + Debug {
    /// Computes the key for `seed`
    ///
    /// ## Parameters
    /// * privilege - Resource mask the seed was requested for
    /// * seed - Seed bytes as received from the target
    fn compute_key(&self, privilege: u8, seed: &[u8]) -> SeedKeyResult<Vec<u8>>;
}

/// Answers every seed with an all zero key
#[derive(Debug, Copy, Clone, Default)]
pub struct SimulatedKey;

impl SeedKey for SimulatedKey {
    fn compute_key(&self, _privilege: u8, _seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        Ok(vec![0; CCP_MAX_KEY])
    }
}

/// Computes keys with a vendor library
#[derive(Debug, Clone)]
pub struct DllSeedKey {
    path: String,
    protocol: Protocol,
}

impl DllSeedKey {
    /// Library at `path` with the entry point of `protocol`. The library is loaded for
    /// each computation and unloaded right after
    pub fn new(path: &str, protocol: Protocol) -> Self {
        Self {
            path: path.to_string(),
            protocol,
        }
    }

    /// Library path
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(feature = "seed-key-dll")]
mod dll {
    use std::os::raw::c_ulong;

    use libloading::Library;

    use super::{CCP_MAX_KEY, SeedKeyError, SeedKeyResult, XCP_MAX_KEY};

    type CcpComputeKeyFn = unsafe extern "C" fn(
        seed: *mut u8,
        size_seed: u16,
        key: *mut u8,
        max_size_key: u16,
        size_key: *mut u16,
    ) -> c_ulong;

    type XcpComputeKeyFn = unsafe extern "C" fn(
        privilege: u8,
        byte_len_seed: u8,
        seed: *mut u8,
        byte_len_key: *mut u8,
        key: *mut u8,
    ) -> c_ulong;

    pub(super) fn ccp_key(path: &str, seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        let lib = unsafe { Library::new(path)? };
        let mut seed_buf = [0u8; 4];
        let n = seed.len().min(4);
        seed_buf[..n].copy_from_slice(&seed[..n]);
        let mut key = [0u8; CCP_MAX_KEY];
        let mut key_len: u16 = 0;
        let ret = unsafe {
            let func = lib.get::<CcpComputeKeyFn>(b"ASAP1A_CCP_ComputeKeyFromSeed\0")?;
            func(
                seed_buf.as_mut_ptr(),
                4,
                key.as_mut_ptr(),
                CCP_MAX_KEY as u16,
                &mut key_len,
            )
        };
        if ret == 0 {
            return Err(SeedKeyError::CcpRejected);
        }
        log::debug!("CCP key of {key_len} bytes from {path}");
        Ok(key.to_vec())
    }

    pub(super) fn xcp_key(path: &str, privilege: u8, seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        let lib = unsafe { Library::new(path)? };
        let mut seed_buf = seed.to_vec();
        let mut key = vec![0u8; XCP_MAX_KEY];
        let mut key_len = XCP_MAX_KEY as u8;
        let ret = unsafe {
            let func = lib.get::<XcpComputeKeyFn>(b"XCP_ComputeKeyFromSeed\0")?;
            func(
                privilege,
                seed_buf.len().min(XCP_MAX_KEY) as u8,
                seed_buf.as_mut_ptr(),
                &mut key_len,
                key.as_mut_ptr(),
            )
        };
        match ret {
            0 => {
                key.truncate(key_len as usize);
                Ok(key)
            }
            1 => Err(SeedKeyError::PrivilegeNotSupported),
            2 => Err(SeedKeyError::WrongSeedLength),
            3 => Err(SeedKeyError::KeyBufferTooSmall),
            other => Err(SeedKeyError::Unknown(other as u64)),
        }
    }
}

impl SeedKey for DllSeedKey {
    #[cfg(feature = "seed-key-dll")]
    fn compute_key(&self, privilege: u8, seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        match self.protocol {
            Protocol::Ccp => dll::ccp_key(&self.path, seed),
            Protocol::Xcp => dll::xcp_key(&self.path, privilege, seed),
        }
    }

    #[cfg(not(feature = "seed-key-dll"))]
    fn compute_key(&self, _privilege: u8, _seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        log::error!("Cannot load {}: {}", self.path, SeedKeyError::NotAvailable);
        Err(SeedKeyError::NotAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_key_is_zero() {
        let key = SimulatedKey.compute_key(0x02, &[1, 2, 3, 4]).unwrap();
        assert_eq!(key, vec![0; CCP_MAX_KEY]);
    }

    #[test]
    fn missing_library_is_an_error() {
        let dll = DllSeedKey::new("/nonexistent/libseedkey.so", Protocol::Xcp);
        assert!(dll.compute_key(0x01, &[0xAA; 4]).is_err());
    }
}
