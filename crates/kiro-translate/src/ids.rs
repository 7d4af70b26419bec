//! Wire-id generation. The upstream has no client-visible ids of its own, so
//! the gateway mints provider-shaped ones.

use uuid::Uuid;

/// Anthropic message id: `msg_` + 24 hex chars.
pub fn message_id() -> String {
    format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// OpenAI completion id: `chatcmpl-` + 24 chars.
pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// Placeholder thinking signature: `sig_` + 32 hex chars. The upstream
/// exposes no real signing, and clients only check the shape.
pub fn thinking_signature() -> String {
    format!("sig_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_hexdigit())
    }

    #[test]
    fn id_shapes() {
        let msg = message_id();
        assert!(msg.starts_with("msg_"));
        assert_eq!(msg.len(), 4 + 24);
        assert!(is_hex(&msg[4..]));

        let chat = chat_completion_id();
        assert!(chat.starts_with("chatcmpl-"));
        assert_eq!(chat.len(), 9 + 24);

        let sig = thinking_signature();
        assert!(sig.starts_with("sig_"));
        assert_eq!(sig.len(), 4 + 32);
        assert!(is_hex(&sig[4..]));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(message_id(), message_id());
        assert_ne!(chat_completion_id(), chat_completion_id());
    }
}
