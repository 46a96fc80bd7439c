use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared staff password for the console. The user name is only logged.
#[derive(Debug)]
pub struct StaffAuthSource {
    password: String,
}

impl StaffAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for StaffAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "console login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
