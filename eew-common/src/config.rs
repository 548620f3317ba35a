use std::str::FromStr;
use std::time;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use envconfig::Envconfig;

/// AWS settings shared by every service. `AWS_ENDPOINT_URL` points all clients at
/// LocalStack/MinIO during development.
#[derive(Envconfig, Clone, Debug)]
pub struct AwsConfig {
    #[envconfig(from = "AWS_REGION", default = "us-west-2")]
    pub aws_region: String,

    #[envconfig(from = "AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,
}

impl AwsConfig {
    pub async fn load(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.aws_region.clone()));

        if let Some(endpoint) = &self.aws_endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        loader.load().await
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ServerConfig {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl ServerConfig {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a number of milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl std::fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "value must not be empty")
    }
}

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.trim().to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ms_duration() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(250)))
        );
        assert_eq!(
            "-1".parse::<EnvMsDuration>(),
            Err(ParseEnvMsDurationError)
        );
        assert_eq!("".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn test_non_empty_string() {
        assert_eq!(
            " OutputWarning ".parse::<NonEmptyString>(),
            Ok(NonEmptyString("OutputWarning".to_owned()))
        );
        assert_eq!("  ".parse::<NonEmptyString>(), Err(StringIsEmptyError));
    }

    #[test]
    fn test_bind_address() {
        let server = ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 3301,
        };
        assert_eq!(server.bind(), "127.0.0.1:3301");
    }
}
