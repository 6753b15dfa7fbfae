// Typed-text preparation.
// A trailing newline (real or the literal two-character `\n` models often
// emit) is not typed; it becomes a follow-up Enter press instead.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypePlan {
    pub text: String,
    pub commit: bool,
}

pub fn plan_typing(content: &str) -> TypePlan {
    if let Some(stripped) = content.strip_suffix("\\n") {
        return TypePlan {
            text: stripped.to_string(),
            commit: true,
        };
    }
    if let Some(stripped) = content.strip_suffix('\n') {
        return TypePlan {
            text: stripped.strip_suffix('\r').unwrap_or(stripped).to_string(),
            commit: true,
        };
    }
    TypePlan {
        text: content.to_string(),
        commit: false,
    }
}
