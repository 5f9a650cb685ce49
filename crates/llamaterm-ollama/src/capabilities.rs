use llamaterm_core::Specialization;

const GENERIC_CAPABILITIES: [&str; 4] = ["completion", "general", "tools", "insert"];

pub fn specialization_from_name(name: &str) -> Option<Specialization> {
    let name = name.to_lowercase();
    if name.contains("code") {
        Some(Specialization::Coding)
    } else if name.contains("vision") {
        Some(Specialization::Vision)
    } else if name.contains("embed") {
        Some(Specialization::Embedding)
    } else {
        None
    }
}

pub fn specialization_from_capabilities<S: AsRef<str>>(capabilities: &[S]) -> Specialization {
    capabilities
        .iter()
        .map(|capability| capability.as_ref().trim().to_lowercase())
        .filter(|capability| !GENERIC_CAPABILITIES.contains(&capability.as_str()))
        .filter_map(|capability| capability.parse::<Specialization>().ok())
        .last()
        .unwrap_or_default()
}

pub fn infer_specialization<S: AsRef<str>>(name: &str, capabilities: &[S]) -> Specialization {
    specialization_from_name(name)
        .unwrap_or_else(|| specialization_from_capabilities(capabilities))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hints_take_priority() {
        assert_eq!(
            infer_specialization("codellama:7b", &["completion", "vision"]),
            Specialization::Coding
        );
        assert_eq!(
            infer_specialization("llama3.2-vision", &["completion"]),
            Specialization::Vision
        );
        assert_eq!(
            infer_specialization("nomic-embed-text", &[] as &[&str]),
            Specialization::Embedding
        );
    }

    #[test]
    fn generic_capabilities_leave_model_general() {
        assert_eq!(
            infer_specialization("llama3:latest", &["completion", "tools", "insert"]),
            Specialization::General
        );
        assert_eq!(
            infer_specialization("mystery", &["completion", "telepathy"]),
            Specialization::General
        );
    }

    #[test]
    fn last_specific_capability_wins() {
        assert_eq!(
            infer_specialization("qwen3", &["completion", "vision", "thinking", "tools"]),
            Specialization::Thinking
        );
    }
}
