//! Types shared between `dromid` and the programs that talk to it: the rule
//! file formats, the prompt argument and the prompt's answer.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier the kernel queue assigned to a packet; verdicts are submitted by it.
pub type PacketId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {expected} fields, got {got}: {input:?}")]
    Parts {
        expected: usize,
        got: usize,
        input: String,
    },
    #[error("bad action {0:?}, should be allow or deny")]
    Action(String),
    #[error("bad port {0:?}, should be a number or *")]
    Port(String),
    #[error("bad proto {0:?}, should be one of tcp, udp, icmp")]
    Proto(String),
    #[error("bad duration amount {0:?}")]
    DurationAmount(String),
    #[error("bad duration unit {0:?}, should be minute or hour")]
    DurationUnit(String),
    #[error("expected yes or no, got {0:?}")]
    YesNo(String),
    #[error("bad prompt argument: {0}")]
    Encoding(String),
}

fn fields(input: &str, expected: usize) -> Result<Vec<&str>, ParseError> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.len() != expected {
        return Err(ParseError::Parts {
            expected,
            got: parts.len(),
            input: input.to_owned(),
        });
    }
    Ok(parts)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
    /// Anything else; never stored in a rule.
    Other(u8),
}

impl Proto {
    /// Maps an IP protocol number (IPv4 protocol / IPv6 next header).
    pub fn from_ip_number(n: u8) -> Proto {
        match n as libc::c_int {
            libc::IPPROTO_TCP => Proto::Tcp,
            libc::IPPROTO_UDP | libc::IPPROTO_UDPLITE => Proto::Udp,
            libc::IPPROTO_ICMP | libc::IPPROTO_ICMPV6 => Proto::Icmp,
            _ => Proto::Other(n),
        }
    }

    pub fn is_matchable(self) -> bool {
        !matches!(self, Proto::Other(_))
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
            Proto::Icmp => f.write_str("icmp"),
            Proto::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

impl FromStr for Proto {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            "icmp" => Ok(Proto::Icmp),
            _ => Err(ParseError::Proto(s.to_owned())),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// `*`: any port, or no port at all (ICMP).
    Any,
    Num(u16),
}

impl Port {
    pub fn number(self) -> Option<u16> {
        match self {
            Port::Any => None,
            Port::Num(n) => Some(n),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Port::Any => f.write_str("*"),
            Port::Num(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Port {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Port::Any);
        }
        s.parse()
            .map(Port::Num)
            .map_err(|_| ParseError::Port(s.to_owned()))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Deny,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        })
    }
}

impl FromStr for Action {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            _ => Err(ParseError::Action(s.to_owned())),
        }
    }
}

/// Identity of a rule. The address is kept textual: a literal IP, an IPv4
/// wildcard like `10.0.*.*`, a subdomain wildcard like `*.example.com` or a
/// hostname.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub address: String,
    pub port: Port,
    pub proto: Proto,
}

impl RuleKey {
    pub fn new<S: Into<String>>(address: S, port: Port, proto: Proto) -> Self {
        RuleKey {
            address: address.into(),
            port,
            proto,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.address, self.port, self.proto)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub key: RuleKey,
    pub action: Action,
    /// `Duration::ZERO` for permanent rules.
    pub duration: Duration,
    /// Only meaningful for temporary rules; permanent rules carry the epoch so
    /// that reloading an unchanged file yields equal rules.
    pub created: DateTime<Utc>,
}

impl Rule {
    pub fn permanent(key: RuleKey, action: Action) -> Self {
        Rule {
            key,
            action,
            duration: Duration::ZERO,
            created: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn temporary(key: RuleKey, action: Action, duration: Duration, created: DateTime<Utc>) -> Self {
        Rule {
            key,
            action,
            duration,
            created,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.duration == Duration::ZERO
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.is_permanent() {
            return false;
        }
        match (now - self.created).to_std() {
            Ok(age) => age > self.duration,
            // created in the future
            Err(_) => false,
        }
    }

    /// Parses a temporary rule file line: `<amount>-<minute|hour> <rule line>`.
    pub fn parse_temporary(line: &str, created: DateTime<Utc>) -> Result<Rule, ParseError> {
        let line = line.trim();
        let (duration, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::Parts {
                expected: 5,
                got: 1,
                input: line.to_owned(),
            })?;
        let duration = parse_duration(duration)?;
        let rule: Rule = rest.parse()?;
        Ok(Rule::temporary(rule.key, rule.action, duration, created))
    }
}

/// The rule file form: `<allow|deny> <address> <port|*> <proto>`.
impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.action, self.key)
    }
}

impl FromStr for Rule {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = fields(s, 4)?;
        let action = parts[0].parse()?;
        let port = parts[2].parse()?;
        let proto = parts[3].parse()?;
        Ok(Rule::permanent(RuleKey::new(parts[1], port, proto), action))
    }
}

/// `<amount>-<minute|hour>`, amount a positive integer.
pub fn parse_duration(s: &str) -> Result<Duration, ParseError> {
    let (amount, unit) = s
        .split_once('-')
        .ok_or_else(|| ParseError::DurationUnit(s.to_owned()))?;
    let bad_amount = || ParseError::DurationAmount(s.to_owned());
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad_amount());
    }
    let amount: u64 = amount.parse().map_err(|_| bad_amount())?;
    if amount == 0 {
        return Err(bad_amount());
    }
    let unit_secs = match unit {
        "minute" => 60,
        "hour" => 60 * 60,
        _ => return Err(ParseError::DurationUnit(s.to_owned())),
    };
    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(bad_amount)
}

/// `*.<last two labels>`; names with fewer than two labels are returned as is.
pub fn subdomain_wildcard(address: &str) -> String {
    let labels: Vec<&str> = address.split('.').collect();
    if labels.len() < 2 {
        return address.to_owned();
    }
    format!("*.{}", labels[labels.len() - 2..].join("."))
}

/// How long a prompt decision should be remembered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Lifetime {
    /// Applies to the prompted flow only.
    Once,
    Forever,
    For(Duration),
}

impl FromStr for Lifetime {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Lifetime::Once),
            "forever" => Ok(Lifetime::Forever),
            _ => parse_duration(s).map(Lifetime::For),
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Lifetime::Once => f.write_str("once"),
            Lifetime::Forever => f.write_str("forever"),
            Lifetime::For(d) if d.as_secs() % 3600 == 0 => write!(f, "{}-hour", d.as_secs() / 3600),
            Lifetime::For(d) => write!(f, "{}-minute", d.as_secs() / 60),
        }
    }
}

fn yes_no(s: &str) -> Result<bool, ParseError> {
    match s {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(ParseError::YesNo(s.to_owned())),
    }
}

/// What the prompt program prints on stdout:
/// `<lifetime> <subdomains> <action> <any port> <reverse>`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PromptAnswer {
    pub lifetime: Lifetime,
    pub subdomains: bool,
    pub action: Action,
    pub any_port: bool,
    pub reverse: bool,
}

impl FromStr for PromptAnswer {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = fields(s, 5)?;
        Ok(PromptAnswer {
            lifetime: parts[0].parse()?,
            subdomains: yes_no(parts[1])?,
            action: parts[2].parse()?,
            any_port: yes_no(parts[3])?,
            reverse: yes_no(parts[4])?,
        })
    }
}

/// One intercepted packet being decided.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: PacketId,
    pub proto: Proto,
    pub src_ip: IpAddr,
    pub src_port: Port,
    pub dst_ip: IpAddr,
    pub dst_port: Port,
    /// Display names; the raw addresses until resolved.
    pub src: String,
    pub dst: String,
}

impl Flow {
    pub fn new(id: PacketId, proto: Proto, src_ip: IpAddr, src_port: Port, dst_ip: IpAddr, dst_port: Port) -> Self {
        Flow {
            id,
            proto,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            src: src_ip.to_string(),
            dst: dst_ip.to_string(),
        }
    }

    pub fn flip(&mut self) {
        std::mem::swap(&mut self.src_ip, &mut self.dst_ip);
        std::mem::swap(&mut self.src_port, &mut self.dst_port);
        std::mem::swap(&mut self.src, &mut self.dst);
    }

    /// The exact key a rule for this flow's destination would have.
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.dst.clone(), self.dst_port, self.proto)
    }

    /// The single argument handed to the prompt program.
    pub fn to_prompt_arg(&self) -> String {
        STANDARD.encode(self.to_string())
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.proto, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// Inverse of [`Flow::to_prompt_arg`], for prompt programs.
pub fn decode_prompt_arg(arg: &str) -> Result<String, ParseError> {
    let bytes = STANDARD
        .decode(arg.trim())
        .map_err(|e| ParseError::Encoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ParseError::Encoding(e.to_string()))
}
