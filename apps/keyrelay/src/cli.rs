use std::path::PathBuf;

use clap::Parser;
use keyrelay_common::GatewayConfigPatch;

#[derive(Parser, Debug)]
#[command(name = "keyrelay", version, about)]
pub(crate) struct Cli {
    /// JSON config file; keys and queue tuning live here.
    #[arg(long, env = "KEYRELAY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "KEYRELAY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "KEYRELAY_PORT")]
    pub(crate) port: Option<u16>,
    /// Outbound proxy for upstream requests.
    #[arg(long, env = "KEYRELAY_PROXY")]
    pub(crate) proxy: Option<String>,
    /// Requests one client may have queued or in flight.
    #[arg(long, env = "KEYRELAY_CONCURRENCY_LIMIT")]
    pub(crate) concurrency_limit: Option<usize>,
    #[arg(long, env = "KEYRELAY_CHECK_KEYS")]
    pub(crate) check_keys: Option<bool>,
    #[arg(long, env = "KEYRELAY_ALLOW_AWS_LOGGING")]
    pub(crate) allow_aws_logging: Option<bool>,
}

impl Cli {
    /// Flag values, already merged over their environment variables by clap.
    pub(crate) fn patch(&self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host.clone(),
            port: self.port,
            proxy: self.proxy.clone(),
            concurrency_limit: self.concurrency_limit,
            check_keys: self.check_keys,
            allow_aws_logging: self.allow_aws_logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_a_patch() {
        let cli = Cli::parse_from(["keyrelay", "--port", "9000", "--check-keys", "false"]);
        let patch = cli.patch();
        assert_eq!(patch.port, Some(9000));
        assert_eq!(patch.check_keys, Some(false));
        assert_eq!(patch.host, None);
    }
}
