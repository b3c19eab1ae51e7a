use crate::constants::DEFAULT_BASE_URL;
use crate::types::{NegotiationRequest, ParleyError, Result, Urgency};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true, env = "PARLEY_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    #[arg(long, global = true, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, global = true, default_value_t = 600)]
    pub request_timeout_secs: u64,
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
    /// Also log to stderr
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a negotiation and follow its event stream
    Negotiate(NegotiateArgs),
    /// Show the negotiation service status
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct NegotiateArgs {
    #[arg(long, default_value = "HOSP_A")]
    pub initiator: String,
    #[arg(long, default_value = "ventilators")]
    pub resource_type: String,
    #[arg(long, default_value_t = 5)]
    pub quantity: u32,
    #[arg(long, value_enum, default_value_t = Urgency::High)]
    pub urgency: Urgency,
    #[arg(long, default_value_t = 7)]
    pub duration_days: u32,
    #[arg(long, default_value_t = 500_000.0)]
    pub max_budget: f64,
    /// Extra JSON object forwarded as `additional_details`
    #[arg(long)]
    pub details: Option<String>,
    /// Replay a captured response body instead of calling the service
    #[arg(long)]
    pub replay: Option<PathBuf>,
    /// Print the final session as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl NegotiateArgs {
    pub fn to_request(&self) -> Result<NegotiationRequest> {
        let additional_details = match &self.details {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        let request = NegotiationRequest {
            initiator: self.initiator.clone(),
            resource_type: self.resource_type.clone(),
            quantity: self.quantity,
            urgency: self.urgency,
            duration_days: self.duration_days,
            max_budget: self.max_budget,
            additional_details,
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&Cli> for ClientConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            base_url: cli.base_url.clone(),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
        }
    }
}

impl ClientConfig {
    pub fn http_client(&self) -> Result<reqwest::Client> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ParleyError::Config(format!(
                "base URL must start with http:// or https://, got '{}'",
                self.base_url
            ))
            .into());
        }
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }
}
