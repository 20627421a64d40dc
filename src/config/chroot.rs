use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chroot::bind::BindRequest;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChrootConfig {
    /// Extra binds as `src[:dest[:opts]]`.
    #[serde(default = "Default::default")]
    pub bind_mounts: Vec<String>,

    /// Bind the host root read-only at `/parentroot`.
    #[serde(default = "default_mount_parent")]
    pub mount_parent: bool,
}

fn default_mount_parent() -> bool {
    true
}

impl Default for ChrootConfig {
    fn default() -> Self {
        Self {
            bind_mounts: vec![],
            mount_parent: default_mount_parent(),
        }
    }
}

impl ChrootConfig {
    pub fn bind_requests(&self) -> Result<Vec<BindRequest>> {
        self.bind_mounts
            .iter()
            .map(|spec| BindRequest::parse(spec))
            .collect()
    }
}

#[cfg(test)]
pub mod tests {

    use std::path::Path;

    use super::*;

    #[test]
    fn test_deserialize_chroot_config() -> Result<()> {
        let config: ChrootConfig = toml::from_str("")?;
        assert_eq!(config, ChrootConfig::default());
        assert!(config.mount_parent);

        let raw = r#"
bind_mounts = ["/srv/cache:/var/cache/pkgs:ro", "/opt"]
mount_parent = false
        "#;
        let config: ChrootConfig = toml::from_str(raw)?;
        assert!(!config.mount_parent);
        let requests = config.bind_requests()?;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].dest, Path::new("/var/cache/pkgs"));
        assert_eq!(requests[1].dest, Path::new("/opt"));

        let config: ChrootConfig = toml::from_str(r#"bind_mounts = ["relative"]"#)?;
        assert!(config.bind_requests().is_err());
        Ok(())
    }
}
