//! Stop-reason vocabularies. The canonical form uses OpenAI names.

pub fn from_anthropic(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" | "tool_use" => "stop",
        "max_tokens" => "length",
        other => other,
    }
    .to_string()
}

pub fn to_anthropic_chat(reason: &str) -> String {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        other => other,
    }
    .to_string()
}

pub fn to_anthropic_text(reason: &str) -> String {
    match reason {
        "stop" | "end_turn" => "stop_sequence",
        "length" => "max_tokens",
        other => other,
    }
    .to_string()
}

pub fn from_google(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        other => return other.to_ascii_lowercase(),
    }
    .to_string()
}

pub fn to_google(reason: &str) -> String {
    match reason {
        "stop" => "STOP",
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        _ => "OTHER",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_between_vocabularies() {
        assert_eq!(from_anthropic("end_turn"), "stop");
        assert_eq!(from_anthropic("max_tokens"), "length");
        assert_eq!(to_anthropic_chat("length"), "max_tokens");
        assert_eq!(to_anthropic_text("stop"), "stop_sequence");
        assert_eq!(from_google("SAFETY"), "content_filter");
        assert_eq!(to_google("stop"), "STOP");
    }
}
