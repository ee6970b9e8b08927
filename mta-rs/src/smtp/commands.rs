use crate::error::{MailError, Result};

/// An ESMTP parameter such as `SIZE=1024` or `BODY=8BITMIME`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParam {
    pub keyword: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// `AUTH mechanism [initial-response]`
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// Empty address for the null sender `<>`
    MailFrom {
        address: String,
        params: Vec<EsmtpParam>,
    },
    RcptTo {
        address: String,
        params: Vec<EsmtpParam>,
    },
    Data,
    Rset,
    Quit,
    Noop,
    StartTls,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "AUTH" => {
                let mut words = args.split_whitespace();
                let mechanism = words
                    .next()
                    .ok_or_else(|| MailError::SmtpProtocol("AUTH requires a mechanism".to_string()))?
                    .to_uppercase();
                let initial_response = words.next().map(str::to_string);
                Ok(SmtpCommand::Auth {
                    mechanism,
                    initial_response,
                })
            }
            "MAIL" => {
                let (address, params) = parse_path(args, "FROM:")?;
                Ok(SmtpCommand::MailFrom { address, params })
            }
            "RCPT" => {
                let (address, params) = parse_path(args, "TO:")?;
                Ok(SmtpCommand::RcptTo { address, params })
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::StartTls),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }
}

impl EsmtpParam {
    /// Value of `SIZE=n`, if this is a well-formed SIZE parameter
    pub fn size(&self) -> Option<usize> {
        if !self.keyword.eq_ignore_ascii_case("SIZE") {
            return None;
        }
        self.value.as_deref().and_then(|v| v.parse().ok())
    }
}

/// Parse `FROM:<address> [params]` / `TO:<address> [params]`
fn parse_path(args: &str, prefix: &str) -> Result<(String, Vec<EsmtpParam>)> {
    let has_prefix = args
        .get(..prefix.len())
        .map(|p| p.eq_ignore_ascii_case(prefix))
        .unwrap_or(false);
    if !has_prefix {
        return Err(MailError::SmtpProtocol(format!("Expected {} syntax", prefix)));
    }

    let rest = args[prefix.len()..].trim_start();
    let (address, params) = if let Some(stripped) = rest.strip_prefix('<') {
        let end = stripped
            .find('>')
            .ok_or_else(|| MailError::SmtpProtocol("Unterminated address".to_string()))?;
        (&stripped[..end], &stripped[end + 1..])
    } else {
        match rest.split_once(' ') {
            Some((address, params)) => (address, params),
            None => (rest, ""),
        }
    };

    let params = params
        .split_whitespace()
        .map(|p| match p.split_once('=') {
            Some((keyword, value)) => EsmtpParam {
                keyword: keyword.to_uppercase(),
                value: Some(value.to_string()),
            },
            None => EsmtpParam {
                keyword: p.to_uppercase(),
                value: None,
            },
        })
        .collect();

    Ok((address.trim().to_string(), params))
}
