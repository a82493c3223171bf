//! The `run` command - attaches to the tun device and translates packets
//! until interrupted.

use clap::Args;
use map646_net::pmtu::DEFAULT_MAX_ENTRIES;
use std::path::PathBuf;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the mapping configuration
    #[arg(long, short, default_value = super::DEFAULT_CONFIG)]
    config: PathBuf,

    /// Name of the tun interface to create or attach to
    #[arg(long, default_value = "tun646")]
    tun_name: String,

    /// Maximum number of Path-MTU cache entries (at least 2)
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES, value_parser = parse_capacity)]
    pmtu_capacity: usize,
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    use crate::route::{CommandRouter, RouteTool};
    use anyhow::Context;
    use map646_net::{Gateway, MappingTable, PmtuConfig, Translator, TranslatorConfig, TunDevice};
    use tracing::info;

    let tun = TunDevice::open(&args.tun_name)
        .with_context(|| format!("cannot open tun device {}", args.tun_name))?;
    let mut router = CommandRouter::new(RouteTool::native(), tun.name());
    router.link_up()?;
    info!("attached to {}", tun.name());

    let config = TranslatorConfig {
        pmtu: PmtuConfig {
            max_entries: args.pmtu_capacity,
            ..PmtuConfig::default()
        },
        ..TranslatorConfig::default()
    };
    let translator = Translator::new(MappingTable::new(), config);
    let mut gateway = Gateway::new(tun, router, translator, args.config);

    if let Err(e) = gateway.start() {
        gateway.shutdown();
        return Err(e).context("initial configuration failed");
    }

    gateway.run().await?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub async fn run(_args: RunArgs) -> anyhow::Result<()> {
    anyhow::bail!("run is only supported on Linux and FreeBSD")
}

fn parse_capacity(s: &str) -> Result<usize, String> {
    let capacity: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if capacity < 2 {
        return Err("pmtu capacity must be at least 2".to_string());
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds() {
        assert_eq!(parse_capacity("128"), Ok(128));
        assert!(parse_capacity("1").is_err());
        assert!(parse_capacity("lots").is_err());
    }
}
