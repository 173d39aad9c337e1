use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::{GenerationConfig, Provider};

use super::Context;

/// Sampling for the image-prompt call; independent of the config's own settings.
pub const IMAGE_PROMPT_MAX_TOKENS: i64 = 200;
pub const IMAGE_PROMPT_TEMPERATURE: f64 = 0.8;

pub const IMAGE_PROMPT_SYSTEM: &str = "You write concise, vivid prompts for image generation models.";

pub fn system_prompt(config: &GenerationConfig) -> String {
    let mut prompt = String::from(
        "You are a social media marketing expert who writes engaging posts for business pages.\n\
         Guidelines:\n\
         - Use a friendly, professional tone.\n\
         - Keep the post concise and easy to read.\n",
    );
    if config.include_emojis {
        prompt.push_str("- Use emojis where they add to the message.\n");
    } else {
        prompt.push_str("- Do not use emojis.\n");
    }
    if config.include_hashtags && config.max_hashtags > 0 {
        prompt.push_str(&format!(
            "- End with at most {} relevant hashtags.\n",
            config.max_hashtags
        ));
    } else {
        prompt.push_str("- Do not add hashtags.\n");
    }
    prompt.push_str("- Return only the post content, without explanations.");
    prompt
}

pub fn user_prompt(prompt: &str, context: &Context) -> String {
    let mut out = format!("Create a social media post about this topic:\n{}", prompt.trim());
    if !context.is_empty() {
        out.push_str("\n\nAdditional context:");
        for (key, value) in context {
            out.push_str(&format!("\n- {key}: {value}"));
        }
    }
    out.push_str(
        "\n\nRequirements:\n\
         - Engaging and relevant to the page's audience\n\
         - Clear call to action when it fits",
    );
    out
}

pub fn image_prompt_request(content: &str) -> String {
    format!(
        "Write an image generation prompt for an illustration that accompanies this social media post:\n\n\
         {}\n\n\
         The prompt must be in English, at most 100 words, and describe the visual style, colours, \
         main elements and atmosphere. Return only the prompt.",
        content.trim()
    )
}

pub fn require_input(provider: Provider, input: &str, what: &str) -> Result<(), ProviderError> {
    if input.trim().is_empty() {
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::InvalidRequest,
            format!("{what} is empty"),
        ));
    }
    Ok(())
}

/// Trim vendor output; whitespace-only output counts as malformed.
pub fn clean_text(provider: Provider, raw: &str) -> Result<String, ProviderError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ProviderError::malformed(provider, "empty completion"));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::config_with;

    #[test]
    fn system_prompt_follows_content_policy() {
        let mut config = config_with("c", Some(Provider::OpenAi), "gpt-4o");
        config.max_hashtags = 3;
        let prompt = system_prompt(&config);
        assert!(prompt.contains("at most 3 relevant hashtags"));
        assert!(prompt.contains("Use emojis"));

        config.include_emojis = false;
        config.include_hashtags = false;
        let prompt = system_prompt(&config);
        assert!(prompt.contains("Do not use emojis"));
        assert!(prompt.contains("Do not add hashtags"));
    }

    #[test]
    fn user_prompt_lists_context() {
        let mut context = Context::new();
        context.insert("page_name".into(), "TechCo".into());
        context.insert("category".into(), "Technology".into());
        let prompt = user_prompt("  Write about AI ", &context);
        assert!(prompt.starts_with("Create a social media post about this topic:\nWrite about AI\n"));
        assert!(prompt.contains("Additional context:\n- category: Technology\n- page_name: TechCo"));
    }

    #[test]
    fn whitespace_completion_is_malformed() {
        let err = clean_text(Provider::Gemini, " \n ").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::MalformedResponse);
        assert_eq!(clean_text(Provider::Gemini, "  hi\n").unwrap(), "hi");
    }
}
