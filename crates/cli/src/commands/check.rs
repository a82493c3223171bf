//! The `check` command - loads a configuration and prints the resulting
//! mapping table without touching the system.

use clap::Args;
use map646_core::read_directives;
use map646_net::MappingTable;
use map646_net::mapping::MAPPING_PREFIX_LEN;
use std::fmt::Write;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the mapping configuration
    #[arg(long, short, default_value = super::DEFAULT_CONFIG)]
    config: PathBuf,
}

pub fn run(args: CheckArgs) -> anyhow::Result<()> {
    let table = load(&args.config)?;
    print!("{}", render(&table));
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<MappingTable> {
    let directives = read_directives(path)?;
    let mut table = MappingTable::new();
    table.load(&directives)?;
    Ok(table)
}

fn render(table: &MappingTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "mapping-prefix {}/{MAPPING_PREFIX_LEN}", table.prefix());
    for entry in table.entries() {
        let _ = writeln!(out, "map-static {} {}", entry.ipv4, entry.ipv6);
    }
    for entry in table.entries66() {
        let _ = writeln!(out, "map66-static {} {}", entry.internal, entry.global);
    }
    out
}
