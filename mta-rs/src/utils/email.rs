use crate::error::{MailError, Result};

/// Basic email validation
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("Email is empty".to_string()));
    }

    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(MailError::InvalidEmail(format!(
            "Email contains whitespace or control characters: {:?}",
            email
        )));
    }

    let (local, domain) = split_address(email)?;

    if local.is_empty() || domain.is_empty() {
        return Err(MailError::InvalidEmail(
            "Email parts cannot be empty".to_string(),
        ));
    }

    if !domain.contains('.') {
        return Err(MailError::InvalidEmail(
            "Domain must contain a dot".to_string(),
        ));
    }

    Ok(())
}

/// Domain part of an address, lowercased
pub fn extract_domain(email: &str) -> Result<String> {
    let (_, domain) = split_address(email)?;
    if domain.is_empty() {
        return Err(MailError::InvalidEmail(format!("Missing domain: {}", email)));
    }
    Ok(domain.to_ascii_lowercase())
}

/// Local part of an address (everything before the `@`)
pub fn local_part(email: &str) -> Result<&str> {
    let (local, _) = split_address(email)?;
    if local.is_empty() {
        return Err(MailError::InvalidEmail(format!("Missing local part: {}", email)));
    }
    Ok(local)
}

fn split_address(email: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(MailError::InvalidEmail(format!(
            "Invalid email format: {}",
            email
        )));
    }
    Ok((parts[0], parts[1]))
}
