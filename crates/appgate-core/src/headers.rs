//! Ordered request header map and the well-known CGI-style key names.
//!
//! Both wire protocols parse into a [`HeaderMap`]: the native protocol decodes
//! its null-delimited pairs straight in, and the HTTP parser normalizes header
//! lines into the same CGI-convention keys. Insertion order is preserved so a
//! dispatched handler observes headers in wire order.

/// `REQUEST_METHOD`: always present after a successful parse.
pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
/// `SERVER_PROTOCOL`: HTTP version token, HTTP sockets only.
pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
/// `REQUEST_URI`: the original path plus query string.
pub const REQUEST_URI: &str = "REQUEST_URI";
/// `PATH_INFO`: unescaped path portion before `?`.
pub const PATH_INFO: &str = "PATH_INFO";
/// `SCRIPT_NAME`: always the empty string for HTTP requests.
pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
/// `QUERY_STRING`: raw text after `?`, possibly empty.
pub const QUERY_STRING: &str = "QUERY_STRING";
/// `CONTENT_LENGTH`: mapped without the `HTTP_` prefix per CGI convention.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
/// `CONTENT_TYPE`: mapped without the `HTTP_` prefix per CGI convention.
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
/// Connect password field on the native protocol.
pub const PASSENGER_CONNECT_PASSWORD: &str = "PASSENGER_CONNECT_PASSWORD";
/// Normalized form of the HTTP `X-Passenger-Connect-Password` header.
pub const HTTP_CONNECT_PASSWORD: &str = "HTTP_X_PASSENGER_CONNECT_PASSWORD";
/// Transaction id correlating a request with analytics records.
pub const PASSENGER_TXN_ID: &str = "PASSENGER_TXN_ID";
/// Application group the request is addressed to.
pub const PASSENGER_GROUP_NAME: &str = "PASSENGER_GROUP_NAME";

/// The `PING` liveness pseudo-method, valid on every socket kind.
pub const PING_METHOD: &str = "PING";

/// An ordered mapping from header name to value.
///
/// Keys are unique: inserting an existing key overwrites its value in place,
/// keeping the original position. Lookup is linear, which is the right trade
/// for the few dozen headers a request carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `name`, returning the previous value if any.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        for entry in &mut self.entries {
            if entry.0 == name {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        self.entries.push((name, value));
        None
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes `name`, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}
