//! ilm.registry — A container registry images can be pulled from.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub addr: String,
}

impl Registry {
    /// Host part of `addr`, used as the prefix of pullable image names.
    pub fn domain(&self) -> &str {
        let addr = self
            .addr
            .strip_prefix("https://")
            .or_else(|| self.addr.strip_prefix("http://"))
            .unwrap_or(&self.addr);
        addr.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_strips_scheme_and_trailing_slash() {
        let registry = Registry {
            addr: "https://registry.local:5000/".into(),
            ..Registry::default()
        };
        assert_eq!(registry.domain(), "registry.local:5000");
    }
}
