use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, DestinationSeed, GenerationConfigSeed};
use crate::graph::{FormLead, LeadForm};
use crate::models::{
    ContentRequest, Destination, GenerationConfig, ItemStatus, Lead, NewGenerationConfig, NewOutcome, PromptSource,
    PublicationOutcome, ScheduledItem, TaskRecord, TaskState,
};

/// All generation config columns in SELECT order (must match GenerationConfig field order).
const CONFIG_COLUMNS: &str = "id, name, description, provider, model, max_tokens, temperature,
    include_hashtags, max_hashtags, include_emojis, is_default, created_at";

const DESTINATION_COLUMNS: &str =
    "id, kind, external_id, name, category, access_token, can_publish, can_read_metrics, is_active, last_sync";

const ITEM_COLUMNS: &str = "id, status, template_prompt, category, manual_content, context, use_markdown, link,
    scheduled_time, generated_content, generated_image_prompt, generated_image_file, error_message,
    requires_approval, approved_by, approved_at, rejection_reason, version, created_at, updated_at";

const OUTCOME_COLUMNS: &str = "id, batch_id, item_id, destination_id, success, external_post_id, post_url,
    error_kind, error_detail, published_at, likes, comments, shares, metrics_updated_at";

const LEAD_COLUMNS: &str = "id, lead_id, destination_id, form_id, form_name, is_organic, ad_id, ad_name,
    campaign_id, campaign_name, fields, created_time, collected_at";

const TASK_COLUMNS: &str = "id, name, payload, state, progress_current, progress_total, result, error, item_id,
    created_at, started_at, completed_at";

/// Timestamp format used for every TEXT time column.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// --- generation configs ---

/// Insert a generation config. A default config clears every other
/// default flag inside the same transaction.
pub async fn insert_generation_config(pool: &SqlitePool, new: &NewGenerationConfig) -> Result<GenerationConfig> {
    let id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await.context("starting config insert transaction")?;

    if new.is_default {
        sqlx::query("UPDATE generation_configs SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await
            .context("clearing previous default config")?;
    }

    sqlx::query(
        "INSERT INTO generation_configs (id, name, description, provider, model, max_tokens, temperature,
         include_hashtags, max_hashtags, include_emojis, is_default, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.provider.map(|p| p.as_str()))
    .bind(&new.model)
    .bind(new.max_tokens)
    .bind(new.temperature)
    .bind(new.include_hashtags)
    .bind(new.max_hashtags)
    .bind(new.include_emojis)
    .bind(new.is_default)
    .bind(ts(Utc::now()))
    .execute(&mut *tx)
    .await
    .with_context(|| format!("inserting generation config '{}'", new.name))?;

    tx.commit().await.context("committing config insert")?;
    debug!(name = %new.name, id = %id, "inserted generation config");

    get_generation_config(pool, &id)
        .await?
        .context("generation config vanished after insert")
}

pub async fn get_generation_config(pool: &SqlitePool, id: &str) -> Result<Option<GenerationConfig>> {
    let config = sqlx::query_as::<_, GenerationConfig>(&format!(
        "SELECT {CONFIG_COLUMNS} FROM generation_configs WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetching generation config")?;
    Ok(config)
}

pub async fn get_generation_config_by_name(pool: &SqlitePool, name: &str) -> Result<Option<GenerationConfig>> {
    let config = sqlx::query_as::<_, GenerationConfig>(&format!(
        "SELECT {CONFIG_COLUMNS} FROM generation_configs WHERE name = ?"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("fetching generation config by name")?;
    Ok(config)
}

/// All configs, oldest first; rows created in the same second keep insertion order.
pub async fn list_generation_configs(pool: &SqlitePool) -> Result<Vec<GenerationConfig>> {
    let configs = sqlx::query_as::<_, GenerationConfig>(&format!(
        "SELECT {CONFIG_COLUMNS} FROM generation_configs ORDER BY created_at ASC, rowid ASC"
    ))
    .fetch_all(pool)
    .await
    .context("listing generation configs")?;
    Ok(configs)
}

pub async fn get_default_config(pool: &SqlitePool) -> Result<Option<GenerationConfig>> {
    let config = sqlx::query_as::<_, GenerationConfig>(&format!(
        "SELECT {CONFIG_COLUMNS} FROM generation_configs WHERE is_default = 1 ORDER BY rowid LIMIT 1"
    ))
    .fetch_optional(pool)
    .await
    .context("fetching default generation config")?;
    Ok(config)
}

/// Make `id` the only default. Returns false (and changes nothing) for an unknown id.
pub async fn set_default_config(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("starting set-default transaction")?;

    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM generation_configs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("checking generation config exists")?;
    if exists.is_none() {
        tx.rollback().await.context("rolling back set-default")?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE generation_configs SET is_default = CASE WHEN id = ? THEN 1 ELSE 0 END,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("updating default flags")?;

    tx.commit().await.context("committing set-default")?;
    Ok(true)
}

/// Upsert a config seed by name. Sampling fields follow the file; the
/// default flag is applied separately so it stays exclusive.
pub async fn upsert_generation_config(pool: &SqlitePool, seed: &GenerationConfigSeed) -> Result<String> {
    let provider = seed.provider.as_deref().map(|p| p.trim().to_lowercase());

    let id = if let Some(existing) = get_generation_config_by_name(pool, &seed.name).await? {
        sqlx::query(
            "UPDATE generation_configs SET description = ?, provider = ?, model = ?, max_tokens = ?,
             temperature = ?, include_hashtags = ?, max_hashtags = ?, include_emojis = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(&seed.description)
        .bind(&provider)
        .bind(&seed.model)
        .bind(seed.max_tokens)
        .bind(seed.temperature)
        .bind(seed.include_hashtags)
        .bind(seed.max_hashtags)
        .bind(seed.include_emojis)
        .bind(&existing.id)
        .execute(pool)
        .await
        .context("updating generation config")?;
        debug!(name = %seed.name, id = %existing.id, "updated generation config");
        existing.id
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO generation_configs (id, name, description, provider, model, max_tokens, temperature,
             include_hashtags, max_hashtags, include_emojis, is_default, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(&seed.name)
        .bind(&seed.description)
        .bind(&provider)
        .bind(&seed.model)
        .bind(seed.max_tokens)
        .bind(seed.temperature)
        .bind(seed.include_hashtags)
        .bind(seed.max_hashtags)
        .bind(seed.include_emojis)
        .bind(ts(Utc::now()))
        .execute(pool)
        .await
        .context("inserting generation config")?;
        debug!(name = %seed.name, id = %id, "inserted generation config");
        id
    };

    if seed.is_default {
        set_default_config(pool, &id).await?;
    }
    Ok(id)
}

// --- destinations ---

/// Upsert a destination by external id. Capability flags are left alone
/// on update; they belong to the permission check.
pub async fn upsert_destination(pool: &SqlitePool, seed: &DestinationSeed) -> Result<String> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM destinations WHERE external_id = ?")
        .bind(&seed.external_id)
        .fetch_optional(pool)
        .await
        .context("checking for existing destination")?;

    if let Some((id,)) = existing {
        sqlx::query(
            "UPDATE destinations SET kind = ?, name = ?, category = ?, access_token = ?, is_active = ? WHERE id = ?",
        )
        .bind(seed.kind)
        .bind(&seed.name)
        .bind(&seed.category)
        .bind(&seed.access_token)
        .bind(seed.is_active)
        .bind(&id)
        .execute(pool)
        .await
        .context("updating destination")?;
        debug!(name = %seed.name, id = %id, "updated destination");
        Ok(id)
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO destinations (id, kind, external_id, name, category, access_token, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(seed.kind)
        .bind(&seed.external_id)
        .bind(&seed.name)
        .bind(&seed.category)
        .bind(&seed.access_token)
        .bind(seed.is_active)
        .execute(pool)
        .await
        .context("inserting destination")?;
        debug!(name = %seed.name, id = %id, "inserted destination");
        Ok(id)
    }
}

/// Insert a destination found through a user token, or refresh the name,
/// category and token of a known one. A known destination keeps its active
/// flag. Returns the id and whether the row is new.
pub async fn record_discovered_destination(pool: &SqlitePool, seed: &DestinationSeed) -> Result<(String, bool)> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM destinations WHERE external_id = ?")
        .bind(&seed.external_id)
        .fetch_optional(pool)
        .await
        .context("checking for discovered destination")?;

    match existing {
        Some((id,)) => {
            sqlx::query("UPDATE destinations SET kind = ?, name = ?, category = ?, access_token = ? WHERE id = ?")
                .bind(seed.kind)
                .bind(&seed.name)
                .bind(&seed.category)
                .bind(&seed.access_token)
                .bind(&id)
                .execute(pool)
                .await
                .context("refreshing discovered destination")?;
            Ok((id, false))
        }
        None => Ok((upsert_destination(pool, seed).await?, true)),
    }
}

#[cfg(test)]
pub async fn get_destination(pool: &SqlitePool, id: &str) -> Result<Option<Destination>> {
    let dest = sqlx::query_as::<_, Destination>(&format!("SELECT {DESTINATION_COLUMNS} FROM destinations WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("fetching destination")?;
    Ok(dest)
}

/// Look a destination up by internal id, falling back to the Graph id.
pub async fn find_destination(pool: &SqlitePool, key: &str) -> Result<Option<Destination>> {
    let dest = sqlx::query_as::<_, Destination>(&format!(
        "SELECT {DESTINATION_COLUMNS} FROM destinations WHERE id = ? OR external_id = ? LIMIT 1"
    ))
    .bind(key)
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("finding destination")?;
    Ok(dest)
}

pub async fn list_destinations(pool: &SqlitePool) -> Result<Vec<Destination>> {
    let dests = sqlx::query_as::<_, Destination>(&format!(
        "SELECT {DESTINATION_COLUMNS} FROM destinations ORDER BY name"
    ))
    .fetch_all(pool)
    .await
    .context("listing destinations")?;
    Ok(dests)
}

/// Destinations linked to an item, in the order they were requested.
pub async fn get_item_destinations(pool: &SqlitePool, item_id: &str) -> Result<Vec<Destination>> {
    let dests = sqlx::query_as::<_, Destination>(
        "SELECT d.id, d.kind, d.external_id, d.name, d.category, d.access_token, d.can_publish,
                d.can_read_metrics, d.is_active, d.last_sync
         FROM destinations d
         JOIN item_destinations l ON l.destination_id = d.id
         WHERE l.item_id = ?
         ORDER BY l.position",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await
    .context("fetching item destinations")?;
    Ok(dests)
}

pub async fn update_destination_capabilities(
    pool: &SqlitePool,
    id: &str,
    can_publish: bool,
    can_read_metrics: bool,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE destinations SET can_publish = ?, can_read_metrics = ?, last_sync = ? WHERE id = ?")
        .bind(can_publish)
        .bind(can_read_metrics)
        .bind(ts(synced_at))
        .bind(id)
        .execute(pool)
        .await
        .context("updating destination capabilities")?;
    Ok(())
}

// --- scheduled items ---

/// Create a pending item linked to `destination_ids` (order preserved).
pub async fn insert_scheduled_item(
    pool: &SqlitePool,
    request: &ContentRequest,
    scheduled_time: DateTime<Utc>,
    destination_ids: &[&str],
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = ts(Utc::now());
    let (template_prompt, category, manual_content) = match &request.prompt {
        PromptSource::Template { prompt, category } => (Some(prompt.as_str()), category.as_deref(), None),
        PromptSource::Manual(text) => (None, None, Some(text.as_str())),
    };
    let context = serde_json::to_string(&request.context).context("serializing item context")?;

    let mut tx = pool.begin().await.context("starting item insert transaction")?;

    sqlx::query(
        "INSERT INTO scheduled_items (id, status, template_prompt, category, manual_content, context,
         use_markdown, link, scheduled_time, requires_approval, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(ItemStatus::Pending)
    .bind(template_prompt)
    .bind(category)
    .bind(manual_content)
    .bind(&context)
    .bind(request.use_markdown)
    .bind(&request.link)
    .bind(ts(scheduled_time))
    .bind(request.requires_approval)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await
    .context("inserting scheduled item")?;

    for (position, dest_id) in destination_ids.iter().enumerate() {
        sqlx::query("INSERT INTO item_destinations (item_id, destination_id, position) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(dest_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .context("linking item destination")?;
    }

    tx.commit().await.context("committing scheduled item")?;
    debug!(id = %id, destinations = destination_ids.len(), "inserted scheduled item");
    Ok(id)
}

pub async fn get_scheduled_item(pool: &SqlitePool, id: &str) -> Result<Option<ScheduledItem>> {
    let item = sqlx::query_as::<_, ScheduledItem>(&format!("SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("fetching scheduled item")?;
    Ok(item)
}

pub async fn list_scheduled_items(pool: &SqlitePool, status: Option<ItemStatus>, limit: i64) -> Result<Vec<ScheduledItem>> {
    let items = match status {
        Some(status) => {
            sqlx::query_as::<_, ScheduledItem>(&format!(
                "SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE status = ? ORDER BY scheduled_time DESC LIMIT ?"
            ))
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, ScheduledItem>(&format!(
                "SELECT {ITEM_COLUMNS} FROM scheduled_items ORDER BY scheduled_time DESC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("listing scheduled items")?;
    Ok(items)
}

/// Conditional status change: only applies while the row still has
/// `from` and `version`. Returns whether this caller won the claim.
pub async fn transition_item(
    pool: &SqlitePool,
    id: &str,
    from: ItemStatus,
    version: i64,
    to: ItemStatus,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET status = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ? AND version = ?",
    )
    .bind(to)
    .bind(ts(Utc::now()))
    .bind(id)
    .bind(from)
    .bind(version)
    .execute(pool)
    .await
    .context("transitioning scheduled item")?;
    Ok(result.rows_affected() == 1)
}

/// Claim `item` for the transition to `to`, using the version it was read at.
pub async fn claim_item(pool: &SqlitePool, item: &ScheduledItem, to: ItemStatus) -> Result<bool> {
    if !item.status.can_transition_to(to) {
        return Ok(false);
    }
    transition_item(pool, &item.id, item.status, item.version, to).await
}

/// Take over a `publishing` claim made at `version` by bumping the version.
/// Only one caller can win this for a given claim.
pub async fn take_publish_claim(pool: &SqlitePool, id: &str, version: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET version = version + 1, updated_at = ?
         WHERE id = ? AND status = ? AND version = ?",
    )
    .bind(ts(Utc::now()))
    .bind(id)
    .bind(ItemStatus::Publishing)
    .bind(version)
    .execute(pool)
    .await
    .context("taking publish claim")?;
    Ok(result.rows_affected() == 1)
}

/// Put an untouched `publishing` claim back to `ready`.
pub async fn release_publish_claim(pool: &SqlitePool, id: &str, version: i64) -> Result<bool> {
    transition_item(pool, id, ItemStatus::Publishing, version, ItemStatus::Ready).await
}

/// Store generated content on an item being generated and move it on.
pub async fn save_generation_result(
    pool: &SqlitePool,
    id: &str,
    content: &str,
    image_prompt: Option<&str>,
    image_file: Option<&str>,
    to: ItemStatus,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET generated_content = ?, generated_image_prompt = ?, generated_image_file = ?,
         error_message = NULL, status = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(content)
    .bind(image_prompt)
    .bind(image_file)
    .bind(to)
    .bind(ts(Utc::now()))
    .bind(id)
    .bind(ItemStatus::Generating)
    .execute(pool)
    .await
    .context("saving generation result")?;
    Ok(result.rows_affected() == 1)
}

/// Move an item to failed with a message, provided it is still in `from`.
pub async fn mark_item_failed(pool: &SqlitePool, id: &str, from: ItemStatus, message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET status = ?, error_message = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(ItemStatus::Failed)
    .bind(message)
    .bind(ts(Utc::now()))
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("marking scheduled item failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_item_published(pool: &SqlitePool, id: &str, note: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET status = ?, error_message = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(ItemStatus::Published)
    .bind(note)
    .bind(ts(Utc::now()))
    .bind(id)
    .bind(ItemStatus::Publishing)
    .execute(pool)
    .await
    .context("marking scheduled item published")?;
    Ok(result.rows_affected() == 1)
}

pub async fn approve_item(pool: &SqlitePool, item: &ScheduledItem, approver: &str, at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET status = ?, approved_by = ?, approved_at = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ? AND version = ?",
    )
    .bind(ItemStatus::Ready)
    .bind(approver)
    .bind(ts(at))
    .bind(ts(at))
    .bind(&item.id)
    .bind(ItemStatus::PendingApproval)
    .bind(item.version)
    .execute(pool)
    .await
    .context("approving scheduled item")?;
    Ok(result.rows_affected() == 1)
}

pub async fn reject_item(
    pool: &SqlitePool,
    item: &ScheduledItem,
    approver: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_items SET status = ?, approved_by = ?, approved_at = ?, rejection_reason = ?,
         version = version + 1, updated_at = ?
         WHERE id = ? AND status = ? AND version = ?",
    )
    .bind(ItemStatus::Rejected)
    .bind(approver)
    .bind(ts(at))
    .bind(reason)
    .bind(ts(at))
    .bind(&item.id)
    .bind(ItemStatus::PendingApproval)
    .bind(item.version)
    .execute(pool)
    .await
    .context("rejecting scheduled item")?;
    Ok(result.rows_affected() == 1)
}

/// Ready items whose time has come, oldest first.
pub async fn get_due_ready_items(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
    let items = sqlx::query_as::<_, ScheduledItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM scheduled_items
         WHERE status = ? AND scheduled_time <= ?
         ORDER BY scheduled_time ASC"
    ))
    .bind(ItemStatus::Ready)
    .bind(ts(now))
    .fetch_all(pool)
    .await
    .context("fetching due ready items")?;
    Ok(items)
}

/// Pending items scheduled at or before `cutoff` (overdue ones included).
pub async fn get_pending_items_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
    let items = sqlx::query_as::<_, ScheduledItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM scheduled_items
         WHERE status = ? AND scheduled_time <= ?
         ORDER BY scheduled_time ASC"
    ))
    .bind(ItemStatus::Pending)
    .bind(ts(cutoff))
    .fetch_all(pool)
    .await
    .context("fetching pending items")?;
    Ok(items)
}

// --- publication outcomes ---

pub async fn insert_outcome(pool: &SqlitePool, outcome: &NewOutcome<'_>, at: DateTime<Utc>) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let post_url = outcome.external_post_id.map(|pid| format!("https://facebook.com/{pid}"));

    sqlx::query(
        "INSERT INTO publication_outcomes (id, batch_id, item_id, destination_id, success, external_post_id,
         post_url, error_kind, error_detail, published_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(outcome.batch_id)
    .bind(outcome.item_id)
    .bind(outcome.destination_id)
    .bind(outcome.error_kind.is_none())
    .bind(outcome.external_post_id)
    .bind(&post_url)
    .bind(outcome.error_kind)
    .bind(outcome.error_detail)
    .bind(ts(at))
    .execute(pool)
    .await
    .context("inserting publication outcome")?;
    Ok(id)
}

pub async fn get_outcomes_for_item(pool: &SqlitePool, item_id: &str) -> Result<Vec<PublicationOutcome>> {
    let outcomes = sqlx::query_as::<_, PublicationOutcome>(&format!(
        "SELECT {OUTCOME_COLUMNS} FROM publication_outcomes WHERE item_id = ? ORDER BY published_at, rowid"
    ))
    .bind(item_id)
    .fetch_all(pool)
    .await
    .context("fetching item outcomes")?;
    Ok(outcomes)
}

#[cfg(test)]
pub async fn get_outcomes_for_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<PublicationOutcome>> {
    let outcomes = sqlx::query_as::<_, PublicationOutcome>(&format!(
        "SELECT {OUTCOME_COLUMNS} FROM publication_outcomes WHERE batch_id = ? ORDER BY rowid"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .context("fetching batch outcomes")?;
    Ok(outcomes)
}

/// Successful outcomes since `since` on destinations that allow metric reads,
/// newest first.
pub async fn get_recent_successful_outcomes(
    pool: &SqlitePool,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<(PublicationOutcome, String)>> {
    let outcomes = sqlx::query_as::<_, PublicationOutcome>(
        "SELECT o.id, o.batch_id, o.item_id, o.destination_id, o.success, o.external_post_id, o.post_url,
                o.error_kind, o.error_detail, o.published_at, o.likes, o.comments, o.shares, o.metrics_updated_at
         FROM publication_outcomes o
         JOIN destinations d ON d.id = o.destination_id
         WHERE o.success = 1 AND o.external_post_id IS NOT NULL AND o.published_at >= ?
           AND d.can_read_metrics = 1
         ORDER BY o.published_at DESC
         LIMIT ?",
    )
    .bind(ts(since))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetching recent outcomes")?;

    let mut with_tokens = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let token: Option<(String,)> = sqlx::query_as("SELECT access_token FROM destinations WHERE id = ?")
            .bind(&outcome.destination_id)
            .fetch_optional(pool)
            .await
            .context("fetching destination token")?;
        if let Some((token,)) = token {
            with_tokens.push((outcome, token));
        }
    }
    Ok(with_tokens)
}

pub async fn update_outcome_metrics(
    pool: &SqlitePool,
    id: &str,
    likes: i64,
    comments: i64,
    shares: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE publication_outcomes SET likes = ?, comments = ?, shares = ?, metrics_updated_at = ? WHERE id = ?",
    )
    .bind(likes)
    .bind(comments)
    .bind(shares)
    .bind(ts(at))
    .bind(id)
    .execute(pool)
    .await
    .context("updating outcome metrics")?;
    Ok(())
}

pub async fn delete_old_outcomes(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM publication_outcomes WHERE published_at < ?")
        .bind(ts(cutoff))
        .execute(pool)
        .await
        .context("deleting old outcomes")?;
    Ok(result.rows_affected())
}

// --- leads ---

/// Store a collected lead once; returns false when it was already known.
pub async fn insert_lead(
    pool: &SqlitePool,
    destination_id: &str,
    form: &LeadForm,
    lead: &FormLead,
    collected_at: DateTime<Utc>,
) -> Result<bool> {
    let fields = serde_json::to_string(&lead.fields).context("serializing lead fields")?;
    let result = sqlx::query(
        "INSERT INTO leads (id, lead_id, destination_id, form_id, form_name, is_organic, ad_id, ad_name,
         campaign_id, campaign_name, fields, created_time, collected_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (lead_id) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&lead.id)
    .bind(destination_id)
    .bind(&form.id)
    .bind(&form.name)
    .bind(lead.is_organic)
    .bind(&lead.ad_id)
    .bind(&lead.ad_name)
    .bind(&lead.campaign_id)
    .bind(&lead.campaign_name)
    .bind(fields)
    .bind(&lead.created_time)
    .bind(ts(collected_at))
    .execute(pool)
    .await
    .context("inserting lead")?;
    Ok(result.rows_affected() == 1)
}

/// Newest leads first, optionally for one destination.
pub async fn list_leads(pool: &SqlitePool, destination_id: Option<&str>, limit: i64) -> Result<Vec<Lead>> {
    let leads = match destination_id {
        Some(destination_id) => {
            sqlx::query_as::<_, Lead>(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE destination_id = ?
                 ORDER BY created_time DESC, collected_at DESC LIMIT ?"
            ))
            .bind(destination_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Lead>(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_time DESC, collected_at DESC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("listing leads")?;
    Ok(leads)
}

// --- tasks ---

pub async fn insert_task(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    payload: &str,
    item_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO tasks (id, name, payload, state, item_id, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(payload)
        .bind(TaskState::Pending)
        .bind(item_id)
        .bind(ts(at))
        .execute(pool)
        .await
        .context("inserting task record")?;
    Ok(())
}

pub async fn mark_task_started(pool: &SqlitePool, id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE tasks SET state = ?, started_at = ? WHERE id = ?")
        .bind(TaskState::Started)
        .bind(ts(at))
        .bind(id)
        .execute(pool)
        .await
        .context("marking task started")?;
    Ok(())
}

pub async fn update_task_progress(pool: &SqlitePool, id: &str, current: u64, total: u64) -> Result<()> {
    sqlx::query("UPDATE tasks SET progress_current = ?, progress_total = ? WHERE id = ?")
        .bind(current as i64)
        .bind(total as i64)
        .bind(id)
        .execute(pool)
        .await
        .context("updating task progress")?;
    Ok(())
}

pub async fn finish_task(
    pool: &SqlitePool,
    id: &str,
    state: TaskState,
    result: Option<&str>,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET state = ?, result = ?, error = ?, completed_at = ? WHERE id = ?")
        .bind(state)
        .bind(result)
        .bind(error)
        .bind(ts(at))
        .bind(id)
        .execute(pool)
        .await
        .context("finishing task record")?;
    Ok(())
}

pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<TaskRecord>> {
    let task = sqlx::query_as::<_, TaskRecord>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("fetching task record")?;
    Ok(task)
}

/// Tasks left pending or started by a previous process can never finish.
pub async fn fail_interrupted_tasks(pool: &SqlitePool, at: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = ?, error = 'interrupted by restart', completed_at = ?
         WHERE state IN (?, ?)",
    )
    .bind(TaskState::Failure)
    .bind(ts(at))
    .bind(TaskState::Pending)
    .bind(TaskState::Started)
    .execute(pool)
    .await
    .context("failing interrupted tasks")?;
    Ok(result.rows_affected())
}

pub async fn delete_finished_tasks(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE completed_at IS NOT NULL AND completed_at < ?")
        .bind(ts(cutoff))
        .execute(pool)
        .await
        .context("deleting finished tasks")?;
    Ok(result.rows_affected())
}

// --- settings ---

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}

/// Sync `[[generation_config]]` and `[[destination]]` seeds into the database.
/// Rows missing from the file are kept: outcomes and items still reference them.
pub async fn sync_config_to_db(pool: &SqlitePool, config: &Config) -> Result<()> {
    for seed in &config.generation_config {
        upsert_generation_config(pool, seed).await?;
    }
    for seed in &config.destination {
        upsert_destination(pool, seed).await?;
    }
    debug!(
        configs = config.generation_config.len(),
        destinations = config.destination.len(),
        "config synced to database"
    );
    Ok(())
}
