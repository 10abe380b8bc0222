use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a route path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route is empty")]
    Empty,
    #[error("route `{route}` must start with `/`")]
    MissingLeadingSlash { route: String },
    #[error("route `{route}` contains an empty path segment")]
    EmptySegment { route: String },
    #[error("route `{route}` escapes the output root")]
    ParentSegment { route: String },
    #[error("route `{route}` contains control characters")]
    ControlCharacter { route: String },
}

/// Logical page path rendered within a batch. Also the correlation id of
/// every per-route protocol message.
///
/// Routes are normalised on construction: a trailing slash is dropped for
/// every route except the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route(String);

impl Route {
    pub fn parse(input: impl AsRef<str>) -> Result<Self, RouteError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(RouteError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(RouteError::MissingLeadingSlash {
                route: raw.to_string(),
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(RouteError::ControlCharacter {
                route: raw.escape_debug().to_string(),
            });
        }

        let trimmed = if raw.len() > 1 {
            raw.trim_end_matches('/')
        } else {
            raw
        };
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        for segment in trimmed.split('/').skip(1) {
            match segment {
                "" => {
                    return Err(RouteError::EmptySegment {
                        route: raw.to_string(),
                    });
                }
                "." | ".." => {
                    return Err(RouteError::ParentSegment {
                        route: raw.to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments below the root, in order. Empty for `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// True when any segment is a `[param]` placeholder that cannot be
    /// rendered statically.
    pub fn is_dynamic(&self) -> bool {
        self.segments()
            .any(|segment| segment.starts_with('[') && segment.ends_with(']'))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Route {
    type Error = RouteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.0
    }
}

impl std::str::FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
