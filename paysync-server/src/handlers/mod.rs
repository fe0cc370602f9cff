//! HTTP route handlers.

pub mod amounts;
pub mod notify;
pub mod orders;
pub mod realtime;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::ServerConfig;
    use crate::state::AppState;
    use crate::storage::ServerStorage;
    use paysync_core::models::ApprovalMode;

    pub const API_KEY: &str = "test-api-key";
    pub const SECRET: &str = "test-shared-secret";

    pub fn state(mode: ApprovalMode) -> AppState {
        let config = ServerConfig {
            api_key: API_KEY.into(),
            shared_secret: SECRET.into(),
            approval_mode: mode,
            ..ServerConfig::default()
        };
        AppState::new(config, ServerStorage::in_memory().unwrap())
    }
}
