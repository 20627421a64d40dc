use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Raise the log level to DEBUG.
    #[serde(default = "Default::default")]
    pub verbose: bool,

    /// Upper bound in seconds for every external tool call. No limit when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,

    /// Reuse an existing image instead of writing partition tables and
    /// formatting filesystems.
    #[serde(default = "Default::default")]
    pub skip_format: bool,
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use anyhow::Result;

    #[test]
    fn test_deserialize_empty_config() -> Result<()> {
        let config: GlobalConfig = toml::from_str("")?;
        assert_eq!(config, GlobalConfig::default());

        let raw = r#"
verbose = true
tool_timeout_secs = 600
        "#;
        let config: GlobalConfig = toml::from_str(raw)?;
        assert_eq!(
            config,
            GlobalConfig {
                verbose: true,
                tool_timeout_secs: Some(600),
                skip_format: false,
            }
        );
        Ok(())
    }

    #[test]
    fn test_deserialize_wrong_config() {
        assert!(toml::from_str::<GlobalConfig>("verbos = true").is_err());
        assert!(toml::from_str::<GlobalConfig>("tool_timeout_secs = -1").is_err());
    }
}
