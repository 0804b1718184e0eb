use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

// ============================================================================
// Permissions
// ============================================================================

/// Permission mask built from the atomic rights READ and WRITE.
///
/// READ lets a frontend subscribe to channels and receive events; WRITE lets
/// it broadcast into channels and trigger worker RPCs. The wire form is the
/// raw integer mask (`ADD_USER {"permissions": 3}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(0b01);
    pub const WRITE: Permissions = Permissions(0b10);
    pub const ALL: Permissions = Permissions(0b11);

    /// Build from a wire mask; bits outside READ|WRITE are ignored.
    pub fn from_mask(mask: u64) -> Self {
        Permissions(mask as u8 & Self::ALL.0)
    }

    pub fn mask(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

// ============================================================================
// Users
// ============================================================================

/// A vhost-scoped identity. Frontend clients become a `User` by redeeming a
/// single-use access token; no password is ever stored on this path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub permissions: Permissions,
}

impl User {
    pub fn new(name: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            name: name.into(),
            permissions,
        }
    }
}

// ============================================================================
// Credential generation
// ============================================================================

const CREDENTIAL_BYTES: usize = 32;

fn random_credential() -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Mint a single-use access token for a frontend `auth` exchange.
pub fn generate_token() -> String {
    random_credential()
}

/// Mint a vhost secret shared with backend workers. Never sent to frontends.
pub fn generate_secret() -> String {
    random_credential()
}

// ============================================================================
// Name validation
// ============================================================================

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-.]+$").expect("invalid name regex"));

static VHOST_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[A-Za-z0-9_\-.]+)+$").expect("invalid vhost path regex"));

/// Channel and user names: non-empty, word characters plus `-` and `.`.
pub fn validate_name(name: &str) -> BrokerResult<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(BrokerError::InvalidName(name.to_owned()))
    }
}

/// Vhost paths: one or more non-empty `/`-prefixed segments, e.g. `/test`
/// or `/apps/chat`. A bare `/` is rejected.
pub fn validate_vhost_path(path: &str) -> BrokerResult<()> {
    if VHOST_PATH_RE.is_match(path) {
        Ok(())
    } else {
        Err(BrokerError::InvalidVhostPath(path.to_owned()))
    }
}

// ============================================================================
// Tests
// ============================================================================
