use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::fallback::Orchestrator;
use crate::models::{Destination, ItemStatus, ScheduledItem};
use crate::providers::{Context as PromptContext, ImageSpec};
use crate::store;

/// Knobs for a generation run that come from config rather than the item.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timezone: Tz,
    pub image: ImageSpec,
    pub fallback_prompt: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            timezone: config.timezone()?,
            image: ImageSpec::from(&config.generation),
            fallback_prompt: config.generation.fallback_prompt.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Generated { status: ItemStatus, has_image: bool },
    Failed { error: String },
    Skipped { reason: String },
}

/// Generate text and (best-effort) image for a scheduled item.
///
/// The item is claimed with a conditional update first; if another worker
/// got there, the run is skipped. Text exhaustion fails the item, and so
/// does any storage error once the claim is held.
pub async fn generate_for_item(
    pool: &SqlitePool,
    orchestrator: &Orchestrator,
    settings: &PipelineSettings,
    item_id: &str,
) -> Result<PipelineOutcome> {
    let item = store::get_scheduled_item(pool, item_id)
        .await?
        .ok_or_else(|| anyhow!("scheduled item '{item_id}' not found"))?;

    if !matches!(item.status, ItemStatus::Pending | ItemStatus::Failed) {
        return Ok(PipelineOutcome::Skipped {
            reason: format!("item is {}", item.status),
        });
    }
    if !store::claim_item(pool, &item, ItemStatus::Generating).await? {
        info!(item_id = %item.id, "item claimed by another worker, skipping generation");
        return Ok(PipelineOutcome::Skipped {
            reason: "claimed by another worker".to_string(),
        });
    }

    match generate_claimed(pool, orchestrator, settings, &item).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Never leave a claimed item in generating on an error path
            mark_failed(pool, &item.id, &format!("{e:#}")).await;
            Err(e)
        }
    }
}

async fn generate_claimed(
    pool: &SqlitePool,
    orchestrator: &Orchestrator,
    settings: &PipelineSettings,
    item: &ScheduledItem,
) -> Result<PipelineOutcome> {
    let destinations = store::get_item_destinations(pool, &item.id)
        .await
        .context("loading item destinations")?;
    let prompt = base_prompt(item, &settings.fallback_prompt);
    let context = build_context(item, &destinations, Utc::now(), settings.timezone);

    info!(item_id = %item.id, destinations = destinations.len(), "generating content");

    let text = match orchestrator.generate_with_fallback(&prompt, &context, None).await {
        Ok(text) => text,
        Err(e) => {
            let message = e.to_string();
            mark_failed(pool, &item.id, &message).await;
            return Ok(PipelineOutcome::Failed { error: message });
        }
    };

    let image_prompt = match orchestrator.generate_image_prompt_with_fallback(&text).await {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(item_id = %item.id, error = %e, "image prompt generation failed, continuing without image");
            None
        }
    };

    let image_file = match &image_prompt {
        Some(p) => match orchestrator.generate_image_with_fallback(p, &settings.image).await {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "image generation failed, continuing without image");
                None
            }
        },
        None => None,
    };

    let next = if item.requires_approval {
        ItemStatus::PendingApproval
    } else {
        ItemStatus::Ready
    };
    let saved = store::save_generation_result(
        pool,
        &item.id,
        &text,
        image_prompt.as_deref(),
        image_file.as_deref(),
        next,
    )
    .await
    .context("saving generated content")?;
    if !saved {
        warn!(item_id = %item.id, "item changed while generating, result discarded");
        return Ok(PipelineOutcome::Skipped {
            reason: "item changed while generating".to_string(),
        });
    }

    info!(item_id = %item.id, status = %next, has_image = image_file.is_some(), "content generated");
    Ok(PipelineOutcome::Generated {
        status: next,
        has_image: image_file.is_some(),
    })
}

async fn mark_failed(pool: &SqlitePool, item_id: &str, message: &str) {
    match store::mark_item_failed(pool, item_id, ItemStatus::Generating, message).await {
        Ok(true) => {}
        Ok(false) => warn!(item_id, "item left generating before it could be marked failed"),
        Err(e) => warn!(item_id, error = %e, "failed to mark item failed"),
    }
}

fn base_prompt(item: &ScheduledItem, fallback: &str) -> String {
    [item.template_prompt.as_deref(), item.manual_content.as_deref()]
        .into_iter()
        .flatten()
        .find(|p| !p.trim().is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Context for the prompt: page name, category and local time, overridden
/// by anything the item carries itself.
pub(crate) fn build_context(
    item: &ScheduledItem,
    destinations: &[Destination],
    now: DateTime<Utc>,
    timezone: Tz,
) -> PromptContext {
    let mut context = PromptContext::new();
    let first = destinations.first();
    if let Some(dest) = first {
        context.insert("page_name".to_string(), dest.name.clone());
    }
    if let Some(category) = item
        .category
        .clone()
        .or_else(|| first.and_then(|d| d.category.clone()))
    {
        context.insert("category".to_string(), category);
    }
    context.insert(
        "current_time".to_string(),
        now.with_timezone(&timezone).format("%Y-%m-%d %H:%M").to_string(),
    );
    context.extend(item.context_map());
    context
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::ProviderConfig;
    use crate::error::ProviderErrorKind;
    use crate::models::Provider;
    use crate::providers::gemini::GeminiAdapter;
    use crate::providers::openai::OpenAiAdapter;
    use crate::providers::{AdapterMap, MediaStore, ProviderAdapter};
    use crate::testutil::{ScriptedAdapter, adapters, seed_config, seed_destination, template_request};
    use crate::db::memory_pool;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            timezone: chrono_tz::America::Sao_Paulo,
            image: ImageSpec::default(),
            fallback_prompt: "Create an engaging social media post.".to_string(),
        }
    }

    async fn new_item(pool: &SqlitePool, prompt: &str, requires_approval: bool) -> String {
        let dest = seed_destination(pool, "TechCo", "1001").await;
        let mut request = template_request(prompt, Some("Technology"));
        request.requires_approval = requires_approval;
        store::insert_scheduled_item(pool, &request, Utc::now(), &[&dest.id])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn falls_back_to_second_vendor_and_trims() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        seed_config(&pool, "smart", Some(Provider::Gemini), "smart-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/models/smart-1:generateContent"))
            .and(body_string_contains("page_name: TechCo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "  AI is transforming...\n"}]}}]
            })))
            .mount(&server)
            .await;

        let media = tempfile::tempdir().unwrap();
        let provider_config = ProviderConfig {
            api_key: Some("test-key".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        };
        let mut map: AdapterMap = AdapterMap::new();
        map.insert(
            Provider::OpenAi,
            Arc::new(OpenAiAdapter::new(&provider_config, MediaStore::new(media.path())).unwrap())
                as Arc<dyn ProviderAdapter>,
        );
        map.insert(
            Provider::Gemini,
            Arc::new(GeminiAdapter::new(&provider_config, MediaStore::new(media.path())).unwrap()),
        );
        let orchestrator = Orchestrator::new(pool.clone(), map);

        let outcome = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Generated {
                status: ItemStatus::Ready,
                has_image: false
            }
        );

        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.generated_content.as_deref(), Some("AI is transforming..."));
        assert_eq!(item.status, ItemStatus::Ready);
    }

    #[tokio::test]
    async fn image_failure_keeps_text() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;

        let openai = Arc::new(
            ScriptedAdapter::new(Provider::OpenAi)
                .text_ok("fast-1", "Post body")
                .image_prompt_ok("a neon city")
                .image_err(ProviderErrorKind::Server),
        );
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai.clone()]));

        let outcome = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Generated { has_image: false, .. }));

        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        assert_eq!(item.generated_content.as_deref(), Some("Post body"));
        assert_eq!(item.generated_image_prompt.as_deref(), Some("a neon city"));
        assert_eq!(item.generated_image_file, None);
        assert_eq!(openai.calls(), ["text:fast-1", "image_prompt:fast-1", "image"]);
    }

    #[tokio::test]
    async fn image_is_attached_when_available() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", true).await;

        let openai = Arc::new(
            ScriptedAdapter::new(Provider::OpenAi)
                .text_ok("fast-1", "Post body")
                .image_prompt_ok("a neon city")
                .image_ok("/media/generated_images/abc.png"),
        );
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai]));

        let outcome = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Generated {
                status: ItemStatus::PendingApproval,
                has_image: true
            }
        );
        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.generated_image_file.as_deref(), Some("/media/generated_images/abc.png"));
    }

    #[tokio::test]
    async fn text_exhaustion_fails_the_item() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;

        let openai = Arc::new(ScriptedAdapter::new(Provider::OpenAi).text_err("fast-1", ProviderErrorKind::Quota));
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai.clone()]));

        let outcome = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));

        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.error_message.unwrap().contains("all 1 configurations failed"));
        // No image work after a text failure
        assert_eq!(openai.calls(), ["text:fast-1"]);

        // A failed item may be regenerated
        let retry = Arc::new(ScriptedAdapter::new(Provider::OpenAi).text_ok("fast-1", "Second try"));
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[retry]));
        generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        assert_eq!(item.error_message, None);
    }

    #[tokio::test]
    async fn storage_error_after_claim_fails_the_item() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;
        sqlx::query("DROP TABLE item_destinations").execute(&pool).await.unwrap();

        let openai = Arc::new(ScriptedAdapter::new(Provider::OpenAi).text_ok("fast-1", "x"));
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai.clone()]));
        let err = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("item destinations"));

        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.error_message.unwrap().contains("item destinations"));
        assert!(openai.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_save_does_not_strand_the_item() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;
        sqlx::query(
            "CREATE TRIGGER reject_content BEFORE UPDATE ON scheduled_items
             WHEN NEW.generated_content IS NOT NULL
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let openai = Arc::new(ScriptedAdapter::new(Provider::OpenAi).text_ok("fast-1", "Post body"));
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai]));
        let err = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("saving generated content"));

        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.generated_content, None);
    }

    #[tokio::test]
    async fn lost_claim_skips_without_calls() {
        let pool = memory_pool().await;
        seed_config(&pool, "fast", Some(Provider::OpenAi), "fast-1").await;
        let item_id = new_item(&pool, "Write about AI", false).await;
        let item = store::get_scheduled_item(&pool, &item_id).await.unwrap().unwrap();
        assert!(store::claim_item(&pool, &item, ItemStatus::Generating).await.unwrap());

        let openai = Arc::new(ScriptedAdapter::new(Provider::OpenAi).text_ok("fast-1", "x"));
        let orchestrator = Orchestrator::new(pool.clone(), adapters(&[openai.clone()]));
        let outcome = generate_for_item(&pool, &orchestrator, &settings(), &item_id)
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Skipped { .. }));
        assert!(openai.calls().is_empty());
    }

    #[tokio::test]
    async fn context_merges_item_values_last() {
        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "TechCo", "1001").await;
        let mut request = template_request("Write about AI", None);
        request.context.insert("page_name".into(), "TechCo Brasil".into());
        request.context.insert("tone".into(), "playful".into());
        let id = store::insert_scheduled_item(&pool, &request, Utc::now(), &[&dest.id])
            .await
            .unwrap();
        let item = store::get_scheduled_item(&pool, &id).await.unwrap().unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap();
        let context = build_context(&item, &[dest], now, chrono_tz::America::Sao_Paulo);

        assert_eq!(context["page_name"], "TechCo Brasil");
        assert_eq!(context["tone"], "playful");
        // Falls back to the destination's category
        assert_eq!(context["category"], "Technology");
        assert_eq!(context["current_time"], "2026-03-10 12:30");
    }

    #[test]
    fn prompt_falls_back_to_literal() {
        let item = ScheduledItem {
            id: "i".into(),
            status: ItemStatus::Pending,
            template_prompt: None,
            category: None,
            manual_content: Some("  ".into()),
            context: "{}".into(),
            use_markdown: false,
            link: None,
            scheduled_time: Utc::now(),
            generated_content: None,
            generated_image_prompt: None,
            generated_image_file: None,
            error_message: None,
            requires_approval: false,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(base_prompt(&item, "fallback"), "fallback");
    }
}
