//! Coordination service locator.
//!
//! `scheme://[user:password@]host:port[/path][?backup=host2:port2,host3:port3&key=value]`

use std::collections::HashMap;
use std::fmt;

use super::ConfigError;

/// Query parameter listing backup addresses.
pub const BACKUP_KEY: &str = "backup";

/// Parsed mediator locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorUrl {
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Primary `host:port`.
    pub address: String,
    pub path: Option<String>,
    pub parameters: HashMap<String, String>,
}

impl MediatorUrl {
    pub fn parse(locator: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidLocator {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = locator
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) if !path.is_empty() => (authority, Some(path.to_string())),
            Some((authority, _)) => (authority, None),
            None => (rest, None),
        };
        let (credential, address) = match authority.rsplit_once('@') {
            Some((credential, address)) => (Some(credential), address),
            None => (None, authority),
        };
        if address.is_empty() {
            return Err(invalid("missing address"));
        }
        let (username, password) = match credential {
            Some(credential) => match credential.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(credential.to_string()), None),
            },
            None => (None, None),
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            username,
            password,
            address: address.to_string(),
            path,
            parameters: query.map(parse_query_string).unwrap_or_default(),
        })
    }

    /// Backup addresses from the `backup` parameter.
    pub fn backup_addresses(&self) -> Vec<String> {
        self.parameters
            .get(BACKUP_KEY)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Primary address followed by backups.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses = vec![self.address.clone()];
        addresses.extend(self.backup_addresses());
        addresses
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

impl fmt::Display for MediatorUrl {
    /// Renders without the password.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.username {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.address)?;
        if let Some(path) = &self.path {
            write!(f, "/{}", path)?;
        }
        Ok(())
    }
}

/// Parse `a=1&b=2` into a map. Keys without `=` map to an empty value.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
