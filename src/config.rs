use super::handler::Adapter;
use super::mailer::SmtpSettings;
use super::validation::Validator;
use super::worker::WorkerConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Idempotent email submission service
#[derive(Parser, Debug, Clone)]
#[command(name = "mailq")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address the HTTP API listens on
    #[arg(long, env = "MAILQ_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Directory of the job database
    #[arg(long, env = "MAILQ_DATABASE_PATH", value_name = "DIR")]
    pub database_path: PathBuf,

    /// Deadline for a single request, in milliseconds
    #[arg(long, env = "MAILQ_REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,

    #[arg(long, env = "MAILQ_MAX_BODY_BYTES", default_value = "1048576")]
    pub max_body_bytes: usize,

    /// How often the worker looks for pending emails, in milliseconds
    #[arg(long, env = "MAILQ_WORKER_POLL_MS", default_value = "500")]
    pub worker_poll_ms: u64,

    /// Send attempts before an email is failed for good
    #[arg(long, env = "MAILQ_MAX_ATTEMPTS", default_value = "5", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MAILQ_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "MAILQ_LOG_JSON")]
    pub log_json: bool,

    /// Validate responses before sending them
    #[arg(long, env = "MAILQ_CHECK_RESPONSES")]
    pub check_responses: bool,

    /// Require sender and recipient to look like `local@domain.tld`
    #[arg(long, env = "MAILQ_STRICT_EMAIL_FORMAT")]
    pub strict_email_format: bool,

    /// Reject string fields longer than this many bytes
    #[arg(long, env = "MAILQ_MAX_FIELD_BYTES")]
    pub max_field_bytes: Option<usize>,

    /// SMTP relay to deliver through. Without it emails are only logged.
    #[arg(long, env = "MAILQ_SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "MAILQ_SMTP_PORT", default_value = "587")]
    pub smtp_port: u16,

    #[arg(long, env = "MAILQ_SMTP_USER", requires = "smtp_pass")]
    pub smtp_user: Option<String>,

    #[arg(long, env = "MAILQ_SMTP_PASS", requires = "smtp_user", hide_env_values = true)]
    pub smtp_pass: Option<String>,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn adapter(&self) -> Adapter {
        let mut validator = Validator::new().with_email_format(self.strict_email_format);
        if let Some(max) = self.max_field_bytes {
            validator = validator.with_max_field_len(max);
        }

        Adapter::new(validator)
            .with_request_timeout(self.request_timeout())
            .with_max_body_bytes(self.max_body_bytes)
            .with_response_checks(self.check_responses)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.worker_poll_ms),
            max_attempts: self.max_attempts,
        }
    }

    /// `None` when no SMTP host is configured.
    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        let host = self.smtp_host.clone()?;
        let credentials = self.smtp_user.clone().zip(self.smtp_pass.clone());

        Some(SmtpSettings {
            host,
            port: self.smtp_port,
            credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_only_database_is_given() {
        let config = Config::try_parse_from(["mailq", "--database-path", "/tmp/mailq"]).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.worker_config().poll_interval, Duration::from_millis(500));
        assert_eq!(config.worker_config().max_attempts, 5);
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert!(!config.check_responses);
        assert!(!config.strict_email_format);
        assert!(config.max_field_bytes.is_none());
    }

    #[test]
    fn database_path_is_required() {
        // env fallback would satisfy the requirement
        if std::env::var_os("MAILQ_DATABASE_PATH").is_some() {
            return;
        }
        assert!(Config::try_parse_from(["mailq"]).is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let res = Config::try_parse_from([
            "mailq",
            "--database-path",
            "/tmp/mailq",
            "--max-attempts",
            "0",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "mailq",
            "--database-path",
            "/tmp/mailq",
            "--listen-addr",
            "127.0.0.1:9000",
            "--request-timeout-ms",
            "250",
            "--log-json",
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert!(config.log_json);
    }

    #[test]
    fn smtp_is_configured_only_with_a_host() {
        // env fallbacks would make the unset case untestable
        if std::env::var_os("MAILQ_SMTP_HOST").is_some() {
            return;
        }
        let config = Config::try_parse_from(["mailq", "--database-path", "/tmp/mailq"]).unwrap();
        assert!(config.smtp_settings().is_none());

        let config = Config::try_parse_from([
            "mailq",
            "--database-path",
            "/tmp/mailq",
            "--smtp-host",
            "smtp.example.com",
            "--smtp-user",
            "mailer",
            "--smtp-pass",
            "secret",
        ])
        .unwrap();
        let settings = config.smtp_settings().unwrap();

        assert_eq!(settings.host, "smtp.example.com");
        assert_eq!(settings.port, 587);
        assert_eq!(
            settings.credentials,
            Some(("mailer".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn smtp_user_requires_password() {
        let res = Config::try_parse_from([
            "mailq",
            "--database-path",
            "/tmp/mailq",
            "--smtp-host",
            "smtp.example.com",
            "--smtp-user",
            "mailer",
        ]);
        if std::env::var_os("MAILQ_SMTP_PASS").is_none() {
            assert!(res.is_err());
        }
    }

    #[test]
    fn strict_validation_is_opt_in() {
        let config = Config::try_parse_from([
            "mailq",
            "--database-path",
            "/tmp/mailq",
            "--strict-email-format",
            "--max-field-bytes",
            "128",
        ])
        .unwrap();

        assert!(config.strict_email_format);
        assert_eq!(config.max_field_bytes, Some(128));
    }
}
