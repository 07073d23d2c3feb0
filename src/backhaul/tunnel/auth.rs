use thiserror::Error;

use crate::backhaul::tunnel::{
    frame::{Frame, FrameType},
    protocol::{AuthPayload, ProtocolError, TunnelDefinition},
};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed auth payload: {0}")]
    Malformed(#[from] ProtocolError),
    #[error("bad secret")]
    BadSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// Server side of the handshake.
///
/// Until a valid AUTH arrives every other frame is ignored. Any error means the
/// caller must drop the connection without answering.
#[derive(Debug)]
pub struct Handshake<'a> {
    secret: &'a str,
    state: AuthState,
}

impl<'a> Handshake<'a> {
    pub fn new(secret: &'a str) -> Self {
        Self {
            secret,
            state: AuthState::Unauthenticated,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Feed one frame received while unauthenticated.
    ///
    /// Returns the requested tunnels on success, `Ok(None)` when the frame was
    /// ignored.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Option<Vec<TunnelDefinition>>, AuthError> {
        if self.state == AuthState::Authenticated || frame.kind != FrameType::Auth {
            return Ok(None);
        }

        let req = AuthPayload::decode(&frame.payload)?;
        if req.secret != self.secret {
            return Err(AuthError::BadSecret);
        }

        self.state = AuthState::Authenticated;
        Ok(Some(req.tunnels))
    }
}

/// Build the client's opening frame. Tunnel ids must already be assigned.
pub fn auth_frame(secret: &str, tunnels: &[TunnelDefinition]) -> Result<Frame, ProtocolError> {
    let payload = AuthPayload {
        secret: secret.to_string(),
        tunnels: tunnels.to_vec(),
    }
    .encode()?;
    Ok(Frame::auth(payload))
}
