use ahash::AHashMap;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;

/// Checks credentials presented with SMTP AUTH.
pub trait UsersRepository: Send + Sync + std::fmt::Debug {
    fn test(&self, user: &str, password: &str) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
}

/// Users listed in the configuration file.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: AHashMap<String, String>,
}

impl StaticUsers {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.name, user.password))
                .collect(),
        }
    }
}

impl UsersRepository for StaticUsers {
    fn test(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|expected| expected == password)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl TryFrom<&str> for Mechanism {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "LOGIN" => Ok(Self::Login),
            _ => Err(()),
        }
    }
}

/// Base64 `Username:` challenge for AUTH LOGIN
pub const LOGIN_USERNAME: &str = "VXNlcm5hbWU6";
/// Base64 `Password:` challenge for AUTH LOGIN
pub const LOGIN_PASSWORD: &str = "UGFzc3dvcmQ6";

pub fn decode(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Split an AUTH PLAIN response, `[authzid] NUL authcid NUL passwd`,
/// into user and password.
pub fn decode_plain(encoded: &str) -> Option<(String, String)> {
    let decoded = decode(encoded)?;
    let parts = decoded.split('\0').collect::<Vec<_>>();

    match parts.as_slice() {
        [_, user, password] | [user, password] if !user.is_empty() => {
            Some(((*user).to_string(), (*password).to_string()))
        }
        _ => None,
    }
}
