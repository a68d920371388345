// Session CRUD surface.
//
// `SessionApi` is what an HTTP front end (or the relay binary's operator
// console) calls to manage sessions. It is a thin layer over the registry
// that also knows which address and port to advertise, so callers can hand
// the result straight to a client. `destroy` is gated by the operator's
// `enable_destroy_api` setting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use trellis_protocol::JoinCode;

use crate::error::ApiError;
use crate::registry::SessionRegistry;

/// Everything a client needs to reach a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub join_code: JoinCode,
    pub relay_address: String,
    pub relay_port: u16,
}

#[derive(Clone)]
pub struct SessionApi {
    registry: Arc<SessionRegistry>,
    relay_address: String,
    relay_port: u16,
    enable_destroy: bool,
}

impl SessionApi {
    pub fn new(
        registry: Arc<SessionRegistry>,
        relay_address: String,
        relay_port: u16,
        enable_destroy: bool,
    ) -> Self {
        Self {
            registry,
            relay_address,
            relay_port,
            enable_destroy,
        }
    }

    pub fn create(&self) -> Result<SessionInfo, ApiError> {
        let code = self.registry.create()?;
        info!("new session {code} on {}:{}", self.relay_address, self.relay_port);
        Ok(self.info(code))
    }

    /// Look up a session by a code as typed by a user.
    pub fn join(&self, raw_code: &str) -> Result<SessionInfo, ApiError> {
        let code = self.resolve(raw_code)?;
        Ok(self.info(code))
    }

    pub fn destroy(&self, raw_code: &str) -> Result<(), ApiError> {
        if !self.enable_destroy {
            return Err(ApiError::DestroyDisabled);
        }
        let code = self.resolve(raw_code)?;
        if self.registry.destroy(&code) {
            Ok(())
        } else {
            // Raced with another destroy or a host leave.
            Err(ApiError::NotFound(raw_code.to_string()))
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry
            .codes()
            .into_iter()
            .map(|code| self.info(code))
            .collect()
    }

    fn resolve(&self, raw_code: &str) -> Result<JoinCode, ApiError> {
        JoinCode::parse(raw_code)
            .ok()
            .filter(|code| self.registry.contains(code))
            .ok_or_else(|| ApiError::NotFound(raw_code.to_string()))
    }

    fn info(&self, join_code: JoinCode) -> SessionInfo {
        SessionInfo {
            join_code,
            relay_address: self.relay_address.clone(),
            relay_port: self.relay_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(enable_destroy: bool) -> SessionApi {
        SessionApi::new(
            Arc::new(SessionRegistry::new(6)),
            "relay.example.net".into(),
            15593,
            enable_destroy,
        )
    }

    #[test]
    fn create_then_join_returns_same_descriptor() {
        let api = api(true);
        let created = api.create().unwrap();
        assert_eq!(created.relay_address, "relay.example.net");
        assert_eq!(created.relay_port, 15593);
        assert_eq!(created.join_code.as_str().len(), 6);

        let lowercase = created.join_code.as_str().to_ascii_lowercase();
        assert_eq!(api.join(&lowercase).unwrap(), created);
    }

    #[test]
    fn join_unknown_or_invalid_is_not_found() {
        let api = api(true);
        assert!(matches!(api.join("ABCDEF"), Err(ApiError::NotFound(_))));
        assert!(matches!(api.join("12-34"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn destroy_removes_session() {
        let api = api(true);
        let info = api.create().unwrap();
        api.destroy(info.join_code.as_str()).unwrap();
        assert!(matches!(
            api.join(info.join_code.as_str()),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            api.destroy(info.join_code.as_str()),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn destroy_can_be_disabled() {
        let api = api(false);
        let info = api.create().unwrap();
        assert!(matches!(
            api.destroy(info.join_code.as_str()),
            Err(ApiError::DestroyDisabled)
        ));
        assert!(api.join(info.join_code.as_str()).is_ok());
    }

    #[test]
    fn session_info_is_json() {
        let info = SessionInfo {
            join_code: JoinCode::parse("HELLOS").unwrap(),
            relay_address: "10.1.2.3".into(),
            relay_port: 4000,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"join_code":"HELLOS","relay_address":"10.1.2.3","relay_port":4000}"#
        );
        assert_eq!(serde_json::from_str::<SessionInfo>(&json).unwrap(), info);
    }

    #[test]
    fn list_reports_live_sessions() {
        let api = api(true);
        let a = api.create().unwrap();
        let b = api.create().unwrap();
        let mut listed: Vec<_> = api.list().into_iter().map(|i| i.join_code).collect();
        listed.sort();
        let mut expected = vec![a.join_code, b.join_code];
        expected.sort();
        assert_eq!(listed, expected);
    }
}
