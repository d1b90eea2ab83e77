//! Secret handling utilities.
//!
//! Re-exports secrecy types and renders secrets safely for display.

pub use secrecy::{ExposeSecret, SecretString};

/// Database URL with any password replaced, for logs and CLI output.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    match (raw.find("://"), raw.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &raw[scheme_end + 3..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}{user}:***{}", &raw[..scheme_end + 3], &raw[at..])
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_are_hidden() {
        let url = SecretString::from("postgres://app:hunter2@db:5432/cases");
        assert_eq!(redact_url(&url), "postgres://app:***@db:5432/cases");
        let file = SecretString::from("sqlite://caseflow.db");
        assert_eq!(redact_url(&file), "sqlite://caseflow.db");
    }
}
