use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

const LATEST: &str = "latest";

/// A fully qualified secret version, `projects/p/[locations/l/]secrets/s/versions/v`. The
/// version defaults to `latest` when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    project: String,
    location: Option<String>,
    secret: String,
    version: String,
}

impl ResourceName {
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Location of a regional secret, `None` for global secrets.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for ResourceName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        let (project, location, secret, version) = match segments.as_slice() {
            ["projects", project, "secrets", secret] => (*project, None, *secret, LATEST),
            ["projects", project, "secrets", secret, "versions", version] => {
                (*project, None, *secret, *version)
            }
            ["projects", project, "locations", location, "secrets", secret] => {
                (*project, Some(*location), *secret, LATEST)
            }
            ["projects", project, "locations", location, "secrets", secret, "versions", version] => {
                (*project, Some(*location), *secret, *version)
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "invalid resource name {name:?}, expected projects/<project>/[locations/<location>/]secrets/<secret>[/versions/<version>]"
                )));
            }
        };

        let valid = [project, secret, version].into_iter().all(is_id)
            && location.is_none_or(is_location);
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "invalid resource name {name:?}, segments may only contain letters, digits, '-' and '_'"
            )));
        }

        Ok(Self {
            project: project.to_string(),
            location: location.map(str::to_string),
            secret: secret.to_string(),
            version: version.to_string(),
        })
    }
}

/// Project ids and numbers, secret ids and versions (numbers or aliases).
fn is_id(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Locations end up in the host name of the regional endpoint.
fn is_location(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}", self.project)?;
        if let Some(location) = &self.location {
            write!(f, "/locations/{location}")?;
        }
        write!(f, "/secrets/{}/versions/{}", self.secret, self.version)
    }
}
