use crate::error::{ConnectorError, Result};
use reqwest::header::HeaderValue;
use std::fmt;
use zeroize::Zeroizing;

/// The kind of account a token belongs to; decides the `Authorization` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Bot,
    Bearer,
}

/// An API credential. The secret is wiped from memory when dropped.
#[derive(Clone)]
pub struct Token {
    kind: TokenKind,
    secret: Zeroizing<String>,
}

impl Token {
    /// Parses a token string. A leading `Bot ` or `Bearer ` selects the scheme,
    /// a bare token is treated as a bot token.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (kind, secret) = if let Some(rest) = raw.strip_prefix("Bot ") {
            (TokenKind::Bot, rest)
        } else if let Some(rest) = raw.strip_prefix("Bearer ") {
            (TokenKind::Bearer, rest)
        } else {
            (TokenKind::Bot, raw)
        };

        let secret = secret.trim();
        if secret.is_empty() {
            return Err(ConnectorError::AuthenticationError(
                "Token must not be empty".to_string(),
            ));
        }
        if secret.chars().any(char::is_whitespace) {
            return Err(ConnectorError::AuthenticationError(
                "Token must not contain whitespace".to_string(),
            ));
        }

        Ok(Self {
            kind,
            secret: Zeroizing::new(secret.to_string()),
        })
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The raw secret, as sent in the gateway identify and resume payloads.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Builds the `Authorization` header value. Marked sensitive so it is
    /// redacted from reqwest's debug output.
    pub fn authorization_header(&self) -> Result<HeaderValue> {
        let scheme = match self.kind {
            TokenKind::Bot => "Bot",
            TokenKind::Bearer => "Bearer",
        };
        let mut value = HeaderValue::from_str(&format!("{} {}", scheme, self.secret.as_str()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// URL-encodes an audit-log reason for the `X-Audit-Log-Reason` header.
pub fn encode_audit_reason(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_token_is_bot() {
        let token = Token::parse("abc.def.ghi").expect("Failed to parse token");
        assert_eq!(token.kind(), TokenKind::Bot);
        assert_eq!(token.secret(), "abc.def.ghi");
        assert_eq!(
            token.authorization_header().unwrap().to_str().unwrap(),
            "Bot abc.def.ghi"
        );
    }

    #[test]
    fn test_parse_bearer_token() {
        let token = Token::parse("Bearer oauth-token").unwrap();
        assert_eq!(token.kind(), TokenKind::Bearer);
        assert_eq!(
            token.authorization_header().unwrap().to_str().unwrap(),
            "Bearer oauth-token"
        );
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        let result = Token::parse("Bot   ");
        assert!(matches!(result, Err(ConnectorError::AuthenticationError(_))));
        assert!(result.unwrap_err().to_string().contains("must not be empty"));

        let result = Token::parse("abc def");
        assert!(matches!(result, Err(ConnectorError::AuthenticationError(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let token = Token::parse("super-secret").unwrap();
        let printed = format!("{:?}", token);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_encode_audit_reason() {
        assert_eq!(encode_audit_reason("spam & abuse"), "spam+%26+abuse");
        assert_eq!(encode_audit_reason("plain"), "plain");
    }
}
