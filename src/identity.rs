//! Identity of the contributor asking for work.
//!
//! Registered users are identified by their numeric id. Anonymous
//! contributors fall back to an external uid (embedding partners) or their
//! IP address. The first present identifier becomes the lock holder id.

use serde::{Deserialize, Serialize};

/// The contributor on whose behalf a scheduling call is made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    /// Registered user id.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Identifier assigned by an embedding partner.
    #[serde(default)]
    pub external_uid: Option<String>,
    /// Client IP address of an anonymous contributor.
    #[serde(default)]
    pub user_ip: Option<String>,
}

impl Requester {
    /// A registered user.
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    /// A contributor known only by an external uid.
    pub fn external(uid: impl Into<String>) -> Self {
        Self {
            external_uid: Some(uid.into()),
            ..Default::default()
        }
    }

    /// An anonymous contributor known only by IP.
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            user_ip: Some(ip.into()),
            ..Default::default()
        }
    }

    /// Holder id used in lock hashes, `None` when no identifier is present.
    pub fn holder_id(&self) -> Option<String> {
        if let Some(id) = self.user_id {
            return Some(id.to_string());
        }
        if let Some(uid) = self.external_uid.as_deref().filter(|u| !u.is_empty()) {
            return Some(format!("ext-{}", uid));
        }
        self.user_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(|ip| format!("ip-{}", ip))
    }

    /// Returns true if the requester carries no usable identifier.
    pub fn is_unidentified(&self) -> bool {
        self.holder_id().is_none()
    }
}
