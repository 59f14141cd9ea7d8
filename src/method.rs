//! HTTP method as a typed enum.
//!
//! The route table accepts exactly the verbs a service registers handlers
//! for. Requests carrying any other method never match a route and are
//! answered with `404` by the router.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A routable HTTP method.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
}

impl Method {
    /// Every routable method, in declaration order.
    pub const ALL: [Method; 7] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Patch,
        Self::Delete,
        Self::Options,
        Self::Head,
    ];

    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get     => "GET",
            Self::Post    => "POST",
            Self::Put     => "PUT",
            Self::Patch   => "PATCH",
            Self::Delete  => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head    => "HEAD",
        }
    }

    /// Maps a transport-level method onto the routable set.
    pub fn from_http(method: &http::Method) -> Option<Self> {
        method.as_str().parse().ok()
    }

    /// Methods whose request body is buffered and classified.
    pub(crate) fn carries_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

/// Parses an uppercase method string (e.g. `"GET"`). Case-sensitive per RFC 9110 §9.1.
impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET"     => Ok(Self::Get),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            "PATCH"   => Ok(Self::Patch),
            "DELETE"  => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "HEAD"    => Ok(Self::Head),
            _         => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_uppercase() {
        assert_eq!("PATCH".parse::<Method>(), Ok(Method::Patch));
        assert!("get".parse::<Method>().is_err());
        assert!("TRACE".parse::<Method>().is_err());
    }

    #[test]
    fn maps_transport_methods() {
        assert_eq!(Method::from_http(&http::Method::DELETE), Some(Method::Delete));
        assert_eq!(Method::from_http(&http::Method::CONNECT), None);
    }
}
