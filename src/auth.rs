use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every user; the user name only picks the
/// session's identity, the database name picks the tenant.
#[derive(Debug)]
pub struct FleetAuthSource {
    password: String,
}

impl FleetAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FleetAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password lookup for user {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
