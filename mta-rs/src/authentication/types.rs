use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Outcome of an SPF evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpfResult {
    /// Sender is authorized
    Pass,
    /// Sender is explicitly not authorized
    Fail,
    /// Sender is probably not authorized
    SoftFail,
    /// Domain makes no assertion (also used when no record exists)
    Neutral,
    /// DNS failure; the client may retry
    TempError,
    /// Record is unusable or the lookup budget was exhausted
    PermError,
}

impl SpfResult {
    /// Whether MAIL FROM is accepted with this result
    pub fn should_accept(&self) -> bool {
        matches!(self, SpfResult::Pass | SpfResult::Neutral | SpfResult::SoftFail)
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        };
        f.write_str(s)
    }
}

/// Qualifier prefix of an SPF term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn split(term: &str) -> (Qualifier, &str) {
        match term.chars().next() {
            Some('+') => (Qualifier::Pass, &term[1..]),
            Some('-') => (Qualifier::Fail, &term[1..]),
            Some('~') => (Qualifier::SoftFail, &term[1..]),
            Some('?') => (Qualifier::Neutral, &term[1..]),
            _ => (Qualifier::Pass, term),
        }
    }

    pub fn result(&self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// Mechanisms this evaluator understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Ip4(Ipv4Addr, u8),
    Ip6(Ipv6Addr, u8),
    /// `a` or `a:domain`
    A(Option<String>),
    /// `mx` or `mx:domain`
    Mx(Option<String>),
    /// `include`, `exists`, `ptr`, modifiers and anything unknown; never matches
    Unsupported(String),
}

/// One whitespace-separated term of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfTerm {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl SpfTerm {
    /// Parse `[qualifier]mechanism[:value][/prefix]`
    ///
    /// Malformed `ip4`/`ip6` values are an error; everything unrecognised
    /// parses as [`Mechanism::Unsupported`].
    pub fn parse(term: &str) -> Result<Self, String> {
        let (qualifier, body) = Qualifier::split(term);
        let (name, value) = match body.find([':', '/', '=']) {
            Some(pos) => (&body[..pos], Some(&body[pos..])),
            None => (body, None),
        };

        let mechanism = match name.to_ascii_lowercase().as_str() {
            "all" if value.is_none() => Mechanism::All,
            "ip4" => {
                let (addr, prefix) = parse_network(value, term, 32)?;
                let addr = addr
                    .parse::<Ipv4Addr>()
                    .map_err(|e| format!("invalid ip4 address in {:?}: {}", term, e))?;
                Mechanism::Ip4(addr, prefix)
            }
            "ip6" => {
                let (addr, prefix) = parse_network(value, term, 128)?;
                let addr = addr
                    .parse::<Ipv6Addr>()
                    .map_err(|e| format!("invalid ip6 address in {:?}: {}", term, e))?;
                Mechanism::Ip6(addr, prefix)
            }
            "a" => Mechanism::A(target_domain(value)),
            "mx" => Mechanism::Mx(target_domain(value)),
            _ => Mechanism::Unsupported(body.to_string()),
        };

        Ok(Self { qualifier, mechanism })
    }

    /// Whether `ip` falls inside an `ip4`/`ip6` network
    pub fn network_contains(&self, ip: IpAddr) -> bool {
        match (&self.mechanism, normalize(ip)) {
            (Mechanism::Ip4(net, prefix), IpAddr::V4(ip)) => {
                let mask = if *prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                u32::from(*net) & mask == u32::from(ip) & mask
            }
            (Mechanism::Ip6(net, prefix), IpAddr::V6(ip)) => {
                let mask = if *prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                u128::from(*net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// IPv4-mapped IPv6 clients are matched as IPv4
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn parse_network<'a>(value: Option<&'a str>, term: &str, max_prefix: u8) -> Result<(&'a str, u8), String> {
    let value = value
        .and_then(|v| v.strip_prefix(':'))
        .ok_or_else(|| format!("missing network in {:?}", term))?;

    match value.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| format!("invalid prefix length in {:?}", term))?;
            if prefix > max_prefix {
                return Err(format!("prefix length out of range in {:?}", term));
            }
            Ok((addr, prefix))
        }
        None => Ok((value, max_prefix)),
    }
}

/// Domain argument of `a`/`mx`; a CIDR suffix is accepted and ignored
fn target_domain(value: Option<&str>) -> Option<String> {
    let domain = value?.strip_prefix(':')?;
    let domain = domain.split('/').next().unwrap_or(domain);
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_ascii_lowercase())
    }
}
