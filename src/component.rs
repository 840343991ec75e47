// Registration errors shared by the registry and trigger factories

#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("Unknown {kind} provider: '{provider}'. Available {kind} providers: {}", available.join(", "))]
    UnknownProvider {
        kind: &'static str,
        provider: String,
        available: &'static [&'static str],
    },
    #[error("Invalid configuration for {kind} {id}: {message}")]
    InvalidConfiguration {
        kind: &'static str,
        id: String,
        message: String,
    },
}

impl ComponentError {
    pub fn invalid(kind: &'static str, id: impl Into<String>, message: impl ToString) -> Self {
        ComponentError::InvalidConfiguration {
            kind,
            id: id.into(),
            message: message.to_string(),
        }
    }
}

/// Keep the first and last characters of a secret, star the rest.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 2 {
        return "*".repeat(chars.len());
    }
    let mut out = String::with_capacity(chars.len());
    out.push(chars[0]);
    out.push_str(&"*".repeat(chars.len() - 2));
    out.push(chars[chars.len() - 1]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_edges() {
        assert_eq!(mask("secret_token"), "s**********n");
        assert_eq!(mask("ab"), "ab");
        assert_eq!(mask("x"), "*");
        assert_eq!(mask(""), "");
    }

    #[test]
    fn unknown_provider_lists_alternatives() {
        let e = ComponentError::UnknownProvider {
            kind: "trigger",
            provider: "smtp".into(),
            available: &["http", "script"],
        };
        assert_eq!(
            e.to_string(),
            "Unknown trigger provider: 'smtp'. Available trigger providers: http, script"
        );
    }
}
