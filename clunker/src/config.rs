use anyhow::{Context, Result};

pub const PORT_ENV_VAR: &str = "CLUNKER_PORT";

/// Runtime settings sourced from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Control-channel port, bound on IPv4 loopback.
    pub control_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(PORT_ENV_VAR).with_context(|| {
            format!("the environment variable {PORT_ENV_VAR} must contain the control port number")
        })?;
        let control_port = raw.trim().parse::<u16>().with_context(|| {
            format!("environment variable {PORT_ENV_VAR} has an invalid port number: {raw}")
        })?;
        Ok(Self { control_port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body so the process-global variable is never raced.
    #[test]
    fn test_settings_from_env() {
        std::env::remove_var(PORT_ENV_VAR);
        assert!(Settings::from_env().is_err());

        std::env::set_var(PORT_ENV_VAR, "not-a-port");
        assert!(Settings::from_env().is_err());

        std::env::set_var(PORT_ENV_VAR, "90210");
        assert!(Settings::from_env().is_err());

        std::env::set_var(PORT_ENV_VAR, "9090");
        assert_eq!(Settings::from_env().unwrap().control_port, 9090);

        std::env::remove_var(PORT_ENV_VAR);
    }
}
