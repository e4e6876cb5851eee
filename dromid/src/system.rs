//! Facts about the host read once at startup. Failing to learn any of them is
//! fatal: there is no safe way to decide flows without them.

use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nix::unistd::User;

pub const PROMPT_USER_ENV: &str = "DROMI_PROMPT_USER";
const PORT_RANGE: &str = "/proc/sys/net/ipv4/ip_local_port_range";

/// The account prompts are shown as: `$DROMI_PROMPT_USER`, or the only
/// directory under `home`.
pub fn prompt_user(home: &Path) -> Result<String> {
    let name = match std::env::var(PROMPT_USER_ENV) {
        Ok(name) if !name.is_empty() => name,
        _ => sole_home_entry(home)?,
    };
    match User::from_name(&name) {
        Ok(Some(_)) => Ok(name),
        Ok(None) => bail!("prompt user {:?} does not exist", name),
        Err(e) => Err(anyhow!(e)).with_context(|| format!("looking up prompt user {:?}", name)),
    }
}

fn sole_home_entry(home: &Path) -> Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(home).with_context(|| format!("listing {}", home.display()))? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    match names.len() {
        1 => Ok(names.remove(0)),
        0 => bail!("{} is empty, set ${} to the user who answers prompts", home.display(), PROMPT_USER_ENV),
        _ => bail!(
            "several users under {} ({}), set ${} to the one who answers prompts",
            home.display(),
            names.join(", "),
            PROMPT_USER_ENV
        ),
    }
}

pub fn ephemeral_ports() -> Result<RangeInclusive<u16>> {
    let raw = fs::read_to_string(PORT_RANGE).with_context(|| format!("reading {}", PORT_RANGE))?;
    parse_port_range(&raw).with_context(|| format!("parsing {}", PORT_RANGE))
}

fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let mut parts = raw.split_whitespace();
    let (low, high) = match (parts.next(), parts.next(), parts.next()) {
        (Some(low), Some(high), None) => (low.parse::<u16>()?, high.parse::<u16>()?),
        _ => bail!("expected two ports, got {:?}", raw),
    };
    if low > high {
        bail!("empty port range {}-{}", low, high);
    }
    Ok(low..=high)
}
