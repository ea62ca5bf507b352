//! Invite links: `<baseURL>#/invite/[<hint>/]<valueID>/<inviteSecret>`.

use weft_core::CoId;
use weft_perms::InviteSecret;

use crate::error::{NodeError, Result};

/// A parsed invite link.
#[derive(Debug, Clone)]
pub struct InviteLink {
    pub value: CoId,
    pub secret: InviteSecret,
    pub hint: Option<String>,
}

/// Render an invite link.
pub fn format_invite_link(
    base_url: &str,
    hint: Option<&str>,
    value: &CoId,
    secret: &InviteSecret,
) -> String {
    match hint {
        Some(hint) => format!("{base_url}#/invite/{hint}/{value}/{secret}"),
        None => format!("{base_url}#/invite/{value}/{secret}"),
    }
}

/// Parse an invite link back into its parts.
pub fn parse_invite_link(link: &str) -> Result<InviteLink> {
    let (_, fragment) = link
        .split_once("#/invite/")
        .ok_or_else(|| NodeError::BadInviteLink("missing #/invite/ fragment".into()))?;

    let parts: Vec<&str> = fragment.split('/').collect();
    let (hint, value_str, secret_str) = match parts.as_slice() {
        [value, secret] => (None, *value, *secret),
        [hint, value, secret] => (Some(hint.to_string()), *value, *secret),
        _ => {
            return Err(NodeError::BadInviteLink(format!(
                "expected 2 or 3 segments, got {}",
                parts.len()
            )))
        }
    };

    let value: CoId = value_str
        .parse()
        .map_err(|_| NodeError::BadInviteLink(format!("bad value id: {value_str}")))?;
    let secret: InviteSecret = secret_str
        .parse()
        .map_err(|_| NodeError::BadInviteLink(format!("bad invite secret: {secret_str}")))?;

    Ok(InviteLink {
        value,
        secret,
        hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_without_hint() {
        let value = CoId::from_bytes([1; 32]);
        let secret = InviteSecret::from_seed([2; 32]);

        let link = format_invite_link("https://example.app", None, &value, &secret);
        let parsed = parse_invite_link(&link).unwrap();
        assert_eq!(parsed.value, value);
        assert_eq!(parsed.secret.agent_id(), secret.agent_id());
        assert_eq!(parsed.hint, None);
    }

    #[test]
    fn test_roundtrip_with_hint() {
        let value = CoId::from_bytes([1; 32]);
        let secret = InviteSecret::from_seed([2; 32]);

        let link = format_invite_link("https://example.app", Some("project"), &value, &secret);
        let parsed = parse_invite_link(&link).unwrap();
        assert_eq!(parsed.hint.as_deref(), Some("project"));
        assert_eq!(parsed.value, value);
    }

    #[test]
    fn test_malformed_links_rejected() {
        assert!(parse_invite_link("https://example.app/nothing").is_err());
        assert!(parse_invite_link("https://example.app#/invite/onlyone").is_err());
        assert!(parse_invite_link("https://example.app#/invite/bad/bad").is_err());
    }
}
