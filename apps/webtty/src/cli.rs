use clap::{Args, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

use webtty_core::config::DeferralPolicy;
use webtty_core::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "webtty",
    about = "Attach the local terminal to a ttyd-compatible remote pty",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "WEBTTY_URL",
        value_name = "URL",
        help = "Base URL of the terminal server; the token is fetched from <URL>/token and the pty is opened at <URL>/ws"
    )]
    pub url: Url,

    #[arg(
        long,
        env = "WEBTTY_POLICY",
        default_value_t = DeferralPolicy::Immediate,
        value_name = "POLICY",
        help = "When to open and attach: immediate, gate-attach or gate-all"
    )]
    pub policy: DeferralPolicy,

    #[arg(
        long,
        env = "WEBTTY_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Use a fixed token instead of requesting one from the server"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        env = "WEBTTY_CREDENTIAL",
        value_name = "USER:PASSWORD",
        hide_env_values = true,
        help = "HTTP basic credential for the token endpoint"
    )]
    pub credential: Option<String>,

    #[arg(
        long,
        value_name = "ID",
        help = "Display slot the session attaches to; a random id when omitted"
    )]
    pub id: Option<String>,

    #[arg(
        long = "allow-origin",
        value_name = "ORIGIN",
        help = "Accept bridge messages only from these origins (repeatable); any origin when omitted"
    )]
    pub allow_origins: Vec<String>,

    #[arg(
        long = "post-message",
        value_name = "PAYLOAD",
        help = "Deliver a bridge message after start, e.g. '?arg=ls&arg=-la' (repeatable)"
    )]
    pub post_messages: Vec<String>,

    #[arg(
        long = "bridge-listen",
        value_name = "ADDR",
        help = "Accept newline-delimited bridge messages over TCP"
    )]
    pub bridge_listen: Option<SocketAddr>,

    #[arg(
        long = "upload",
        value_name = "PATH",
        help = "Files sent when the remote requests an upload (repeatable)"
    )]
    pub uploads: Vec<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "WEBTTY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "WEBTTY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
