//! Compact signaling codec: connection description <-> URL/QR-safe token.
//!
//! Pipeline: JSON text -> UTF-8 -> standard base64 -> `+`/`/` swapped for `-`/`_` -> padding stripped.
//! Decoding reverses every step and rebuilds the padding from the token length.

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

/// Base64 block size; padding is reconstructed modulo this.
const BLOCK: usize = 4;

/// Negotiation role of a description, as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// One side's connection parameters. Opaque to the core; only transported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    #[serde(alias = "body")]
    pub sdp: String,
}

impl ConnectionDescription {
    pub fn new(kind: DescriptionKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// URL-safe token produced by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompactToken(String);

impl CompactToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CompactToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("failed to serialize description: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Encode a description into a compact token.
pub fn encode(description: &ConnectionDescription) -> Result<CompactToken, SignalError> {
    let text = serde_json::to_string(description)?;
    let standard = general_purpose::STANDARD.encode(text.as_bytes());
    let token: String = standard
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    Ok(CompactToken(token))
}

/// Decode a token (typed, pasted or scanned) back into a description.
pub fn decode(token: &str) -> Result<ConnectionDescription, SignalError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SignalError::MalformedToken("empty token".into()));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(SignalError::MalformedToken(format!(
            "unexpected character {:?}",
            bad
        )));
    }
    let pad = match token.len() % BLOCK {
        0 => 0,
        2 => 2,
        3 => 1,
        _ => {
            return Err(SignalError::MalformedToken(format!(
                "invalid length {}",
                token.len()
            )))
        }
    };
    let mut standard = String::with_capacity(token.len() + pad);
    standard.extend(token.chars().map(|c| match c {
        '-' => '+',
        '_' => '/',
        other => other,
    }));
    standard.extend(std::iter::repeat('=').take(pad));

    let bytes = general_purpose::STANDARD
        .decode(standard.as_bytes())
        .map_err(|e| SignalError::MalformedToken(format!("base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| SignalError::MalformedToken(format!("utf-8: {}", e)))?;
    serde_json::from_str(&text).map_err(|e| SignalError::MalformedToken(format!("json: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
        a=group:BUNDLE 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        c=IN IP4 0.0.0.0\r\na=ice-ufrag:8hhY\r\na=ice-pwd:asd88fgpdd777uzjYhagZg\r\n\
        a=fingerprint:sha-256 9F:0A:11:B2\r\na=setup:actpass\r\na=mid:0\r\n\
        a=sctp-port:5000\r\na=candidate:1 1 udp 2122260223 192.168.1.20 54400 typ host\r\n";

    #[test]
    fn offer_example_roundtrip() {
        let d = ConnectionDescription::new(DescriptionKind::Offer, "X");
        let token = encode(&d).unwrap();
        assert_eq!(decode(token.as_str()).unwrap(), d);
    }

    #[test]
    fn token_is_url_safe_and_unpadded() {
        // Lengths chosen so every padding remainder is exercised.
        for n in 0..12 {
            let d = ConnectionDescription::new(DescriptionKind::Answer, "?".repeat(n) + SAMPLE_SDP);
            let token = encode(&d).unwrap();
            assert!(token
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert_ne!(token.as_str().len() % 4, 1);
            assert_eq!(decode(token.as_str()).unwrap(), d);
        }
    }

    #[test]
    fn body_alias_accepted() {
        let raw = general_purpose::STANDARD.encode(br#"{"type":"offer","body":"X"}"#);
        let token = raw.trim_end_matches('=').replace('+', "-").replace('/', "_");
        let d = decode(&token).unwrap();
        assert_eq!(d, ConnectionDescription::new(DescriptionKind::Offer, "X"));
    }

    #[test]
    fn surrounding_whitespace_from_scanner_is_ignored() {
        let d = ConnectionDescription::new(DescriptionKind::Offer, SAMPLE_SDP);
        let token = encode(&d).unwrap();
        assert_eq!(decode(&format!("  {}\n", token)).unwrap(), d);
    }

    #[test]
    fn malformed_inputs_are_reported() {
        for bad in ["", "a", "abcde", "ab+c", "ab/c", "ab=c", "%%%%"] {
            assert!(
                matches!(decode(bad), Err(SignalError::MalformedToken(_))),
                "{:?} should be malformed",
                bad
            );
        }
    }

    #[test]
    fn valid_base64_but_not_json_is_malformed() {
        let token = general_purpose::STANDARD
            .encode(b"not json at all")
            .trim_end_matches('=')
            .to_string();
        assert!(matches!(
            decode(&token),
            Err(SignalError::MalformedToken(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let token = general_purpose::STANDARD
            .encode([0xffu8, 0xfe, 0xfd])
            .trim_end_matches('=')
            .to_string();
        assert!(matches!(
            decode(&token),
            Err(SignalError::MalformedToken(_))
        ));
    }
}
