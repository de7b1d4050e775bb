use serde::Serialize;

/// A selectable model as shown to clients. `speed` is output tokens per second,
/// `intelligence` a relative index; both are display hints only.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub speed: u32,
    pub intelligence: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_new: bool,
}

const fn model(id: &'static str, name: &'static str, speed: u32, intelligence: u32) -> ModelInfo {
    ModelInfo {
        id,
        name,
        speed,
        intelligence,
        is_new: false,
    }
}

const fn new_model(
    id: &'static str,
    name: &'static str,
    speed: u32,
    intelligence: u32,
) -> ModelInfo {
    ModelInfo {
        is_new: true,
        ..model(id, name, speed, intelligence)
    }
}

pub const MODELS: &[ModelInfo] = &[
    model("openai/gpt-4o", "GPT 4o", 193, 50),
    model("openai/gpt-4o-mini", "GPT 4o Mini", 68, 36),
    model("openai/gpt-4.1", "GPT 4.1", 132, 53),
    model("openai/gpt-4.1-mini", "GPT 4.1 Mini", 229, 53),
    model("openai/gpt-4.1-nano", "GPT 4.1 Nano", 293, 41),
    new_model("openai/o3", "o3", 130, 72),
    new_model("openai/o4-mini", "o4 Mini", 139, 70),
    model("anthropic/claude-3-5-sonnet", "Claude 3.5 Sonnet", 77, 44),
    model("anthropic/claude-3-7-sonnet", "Claude 3.7 Sonnet", 76, 57),
    model("google/gemini-2.0-flash", "Gemini 2.0 Flash", 250, 48),
    model(
        "google/gemini-2.5-pro-exp-03-25",
        "Gemini 2.5 Pro Experimental",
        162,
        68,
    ),
];

/// Model preselected for a fresh conversation.
pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-nano";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::route;

    fn lookup(id: &str) -> Option<&'static ModelInfo> {
        MODELS.iter().find(|m| m.id == id)
    }

    #[test]
    fn every_listed_model_routes_to_a_known_provider() {
        for info in MODELS {
            let r = route(info.id).unwrap_or_else(|e| panic!("{}: {e}", info.id));
            assert_eq!(r.composite, info.id);
        }
        assert!(lookup(DEFAULT_MODEL).is_some());
    }

    #[test]
    fn is_new_is_only_serialized_when_set() {
        let plain = serde_json::to_value(lookup("openai/gpt-4o").unwrap()).unwrap();
        assert!(plain.get("is_new").is_none());
        let fresh = serde_json::to_value(lookup("openai/o3").unwrap()).unwrap();
        assert_eq!(fresh["is_new"], true);
    }
}
