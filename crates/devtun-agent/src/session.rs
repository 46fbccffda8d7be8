use std::fmt;

use uuid::Uuid;

use crate::mux::{MuxError, MuxSession, MuxStream};
use crate::types::DeviceKey;

/// Identity of one registration of a session.
///
/// Assigned by the registry on insert, so a session that was superseded can
/// never remove its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live tunnel for one device
pub struct DeviceSession {
    key: DeviceKey,
    endpoint: String,
    mux: MuxSession,
    token: SessionToken,
}

impl DeviceSession {
    pub fn new(key: DeviceKey, endpoint: impl Into<String>, mux: MuxSession) -> Self {
        Self {
            key,
            endpoint: endpoint.into(),
            mux,
            token: SessionToken::default(),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Access point this session is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub(crate) fn assign_token(&mut self) -> SessionToken {
        self.token = SessionToken::generate();
        self.token
    }

    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        self.mux.accept().await
    }

    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish()
    }
}
