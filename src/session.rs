use std::sync::RwLock;
use async_trait::async_trait;
use glam::Vec3;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

/// What the login service knows about an agent whose circuit was authorized
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoginInfo {
    pub first_name: String,
    pub last_name: String,
    pub secure_session_id: Uuid,
    pub start_position: Vec3,
    pub look_at: Vec3,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthenticateResponse {
    pub authorized: bool,
    pub login_info: Option<LoginInfo>,
}

impl AuthenticateResponse {
    pub fn authorized(login_info: LoginInfo) -> AuthenticateResponse {
        AuthenticateResponse {
            authorized: true,
            login_info: Some(login_info),
        }
    }

    pub fn rejected() -> AuthenticateResponse {
        AuthenticateResponse::default()
    }
}

/// Verifies the (session, agent, circuit code) triple a viewer presents in `UseCircuitCode`
///  against the circuits the login service announced
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionAuthenticator: Send + Sync + 'static {
    async fn authenticate(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> anyhow::Result<AuthenticateResponse>;
}

struct ExpectedCircuit {
    session_id: Uuid,
    agent_id: Uuid,
    login_info: LoginInfo,
}

/// An authenticator for circuits that were registered up front, e.g. by the login handler
///  running in the same process
#[derive(Default)]
pub struct InMemoryAuthenticator {
    circuits: RwLock<FxHashMap<u32, ExpectedCircuit>>,
}

impl InMemoryAuthenticator {
    pub fn new() -> InMemoryAuthenticator {
        Default::default()
    }

    pub fn add_circuit(&self, circuit_code: u32, session_id: Uuid, agent_id: Uuid, login_info: LoginInfo) {
        debug!("expecting circuit {} for agent {}", circuit_code, agent_id);
        self.circuits.write().unwrap()
            .insert(circuit_code, ExpectedCircuit { session_id, agent_id, login_info });
    }

    pub fn remove_circuit(&self, circuit_code: u32) -> bool {
        self.circuits.write().unwrap()
            .remove(&circuit_code)
            .is_some()
    }
}

#[async_trait]
impl SessionAuthenticator for InMemoryAuthenticator {
    async fn authenticate(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> anyhow::Result<AuthenticateResponse> {
        let circuits = self.circuits.read().unwrap();
        let response = match circuits.get(&circuit_code) {
            Some(expected) if expected.session_id == session_id && expected.agent_id == agent_id => {
                AuthenticateResponse::authorized(expected.login_info.clone())
            }
            _ => AuthenticateResponse::rejected(),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SESSION: Uuid = Uuid::from_u128(1);
    const AGENT: Uuid = Uuid::from_u128(2);

    fn authenticator() -> InMemoryAuthenticator {
        let result = InMemoryAuthenticator::new();
        result.add_circuit(77, SESSION, AGENT, LoginInfo {
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            ..Default::default()
        });
        result
    }

    #[tokio::test]
    async fn test_authorized() {
        let response = authenticator().authenticate(SESSION, AGENT, 77).await.unwrap();
        assert!(response.authorized);
        assert_eq!(response.login_info.unwrap().first_name, "Test");
    }

    #[rstest]
    #[case::wrong_code(SESSION, AGENT, 78)]
    #[case::wrong_session(Uuid::from_u128(9), AGENT, 77)]
    #[case::wrong_agent(SESSION, Uuid::from_u128(9), 77)]
    #[tokio::test]
    async fn test_rejected(#[case] session_id: Uuid, #[case] agent_id: Uuid, #[case] code: u32) {
        let response = authenticator().authenticate(session_id, agent_id, code).await.unwrap();
        assert_eq!(response, AuthenticateResponse::rejected());
    }

    #[tokio::test]
    async fn test_remove_circuit() {
        let authenticator = authenticator();
        assert!(authenticator.remove_circuit(77));
        assert!(!authenticator.remove_circuit(77));
        assert!(!authenticator.authenticate(SESSION, AGENT, 77).await.unwrap().authorized);
    }
}
