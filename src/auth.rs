use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use thiserror::Error;
use ulid::Ulid;

use crate::model::UserId;

/// Every login shares one password; identity comes from the user name.
#[derive(Debug)]
pub struct SharedPasswordAuthSource {
    password: String,
}

impl SharedPasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password login for {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no login user on this session")]
    Anonymous,
    #[error("login {0:?} is not a user id")]
    NotAUserId(String),
}

/// The requesting user of a session: its login name, parsed as a ULID.
pub fn requester_from_login(login: Option<&str>) -> Result<UserId, AuthError> {
    let login = login.ok_or(AuthError::Anonymous)?;
    Ulid::from_string(login.trim()).map_err(|_| AuthError::NotAUserId(login.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_must_be_a_ulid() {
        let id = Ulid::new();
        assert_eq!(requester_from_login(Some(&id.to_string())), Ok(id));
        assert_eq!(requester_from_login(None), Err(AuthError::Anonymous));
        assert_eq!(
            requester_from_login(Some("postgres")),
            Err(AuthError::NotAUserId("postgres".into()))
        );
    }
}
