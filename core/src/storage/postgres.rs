use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Storage, Transition};
use crate::error::{EngineError, Result};
use crate::models::db::{
    Bot, ChatState, EnvironmentVar, Handler, Hook, HttpMethod, Param, Platform, PlatformBinding,
    Recipient, RequestSpec, ResponseSpec, State,
};
use crate::models::message::ChatIdentity;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[derive(FromRow)]
struct HandlerRow {
    id: String,
    bot_id: String,
    name: String,
    pattern: String,
    priority: i32,
    seq: i64,
    enabled: bool,
    target_state_id: Option<String>,
    request_id: Option<String>,
    url_template: Option<String>,
    method: Option<String>,
    data: Option<String>,
    response_id: String,
    text_template: String,
    keyboard_template: Option<String>,
}

#[derive(FromRow)]
struct ParamRow {
    request_id: String,
    kind: String,
    key: String,
    value_template: String,
}

#[derive(FromRow)]
struct SourceStateRow {
    handler_id: String,
    state_id: String,
}

#[derive(FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    chat_state: ChatState,
    inserted: bool,
}

const HANDLER_SELECT: &str = r#"
    SELECT
        h.id, h.bot_id, h.name, h.pattern, h.priority, h.seq, h.enabled, h.target_state_id,
        r.id AS request_id, r.url_template, r.method, r.data,
        p.id AS response_id, p.text_template, p.keyboard_template
    FROM handlers h
    LEFT JOIN requests r ON r.id = h.request_id
    JOIN responses p ON p.id = h.response_id
"#;

async fn write_response(conn: &mut PgConnection, response: &ResponseSpec) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO responses (id, text_template, keyboard_template)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET text_template = EXCLUDED.text_template, keyboard_template = EXCLUDED.keyboard_template
        "#,
    )
    .bind(&response.id)
    .bind(&response.text_template)
    .bind(&response.keyboard_template)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_request(conn: &mut PgConnection, request: &RequestSpec) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO requests (id, url_template, method, data)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET url_template = EXCLUDED.url_template, method = EXCLUDED.method, data = EXCLUDED.data
        "#,
    )
    .bind(&request.id)
    .bind(&request.url_template)
    .bind(request.method.as_str())
    .bind(&request.data)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM request_params WHERE request_id = $1")
        .bind(&request.id)
        .execute(&mut *conn)
        .await?;

    let params = request
        .url_parameters
        .iter()
        .enumerate()
        .map(|(i, p)| ("url", i, p))
        .chain(
            request
                .header_parameters
                .iter()
                .enumerate()
                .map(|(i, p)| ("header", i, p)),
        );
    for (kind, position, param) in params {
        sqlx::query(
            r#"
            INSERT INTO request_params (request_id, kind, position, key, value_template)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&request.id)
        .bind(kind)
        .bind(position as i32)
        .bind(&param.key)
        .bind(&param.value_template)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_source_states(conn: &mut PgConnection, handler_id: &str, states: &[String]) -> Result<()> {
    sqlx::query("DELETE FROM handler_source_states WHERE handler_id = $1")
        .bind(handler_id)
        .execute(&mut *conn)
        .await?;
    for state_id in states {
        sqlx::query("INSERT INTO handler_source_states (handler_id, state_id) VALUES ($1, $2)")
            .bind(handler_id)
            .bind(state_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

impl PgStorage {
    /// Assembles handlers from their joined rows plus bulk-loaded params and
    /// source states.
    async fn hydrate_handlers(&self, rows: Vec<HandlerRow>) -> Result<Vec<Handler>> {
        let handler_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let request_ids: Vec<String> = rows.iter().filter_map(|r| r.request_id.clone()).collect();

        let params = sqlx::query_as::<_, ParamRow>(
            r#"
            SELECT request_id, kind, key, value_template
            FROM request_params
            WHERE request_id = ANY($1)
            ORDER BY request_id, kind, position
            "#,
        )
        .bind(&request_ids)
        .fetch_all(&self.pool)
        .await?;

        let sources = sqlx::query_as::<_, SourceStateRow>(
            "SELECT handler_id, state_id FROM handler_source_states WHERE handler_id = ANY($1)",
        )
        .bind(&handler_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut url_params: HashMap<String, Vec<Param>> = HashMap::new();
        let mut header_params: HashMap<String, Vec<Param>> = HashMap::new();
        for p in params {
            let bucket = if p.kind == "header" {
                &mut header_params
            } else {
                &mut url_params
            };
            bucket
                .entry(p.request_id)
                .or_default()
                .push(Param::new(p.key, p.value_template));
        }

        let mut source_states: HashMap<String, Vec<String>> = HashMap::new();
        for s in sources {
            source_states.entry(s.handler_id).or_default().push(s.state_id);
        }

        let mut handlers = Vec::with_capacity(rows.len());
        for row in rows {
            let request = match (row.request_id, row.url_template, row.method) {
                (Some(request_id), Some(url_template), Some(method)) => Some(RequestSpec {
                    url_parameters: url_params.remove(&request_id).unwrap_or_default(),
                    header_parameters: header_params.remove(&request_id).unwrap_or_default(),
                    id: request_id,
                    url_template,
                    method: HttpMethod::from_str(&method)?,
                    data: row.data,
                }),
                _ => None,
            };
            handlers.push(Handler {
                source_states: source_states.remove(&row.id).unwrap_or_default(),
                id: row.id,
                bot_id: row.bot_id,
                name: row.name,
                pattern: row.pattern,
                priority: row.priority,
                seq: row.seq,
                enabled: row.enabled,
                target_state: row.target_state_id,
                request,
                response: ResponseSpec {
                    id: row.response_id,
                    text_template: row.text_template,
                    keyboard_template: row.keyboard_template,
                },
            });
        }
        Ok(handlers)
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn insert_bot(&self, bot: &Bot) -> Result<()> {
        sqlx::query(
            "INSERT INTO bots (id, owner_id, name, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&bot.id)
        .bind(&bot.owner_id)
        .bind(&bot.name)
        .bind(bot.created_at)
        .bind(bot.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        let bot = sqlx::query_as::<_, Bot>("SELECT * FROM bots WHERE id = $1")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bot)
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM bots WHERE id = $1")
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_binding(&self, binding: &PlatformBinding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_bindings (id, bot_id, platform, token, username, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET token = EXCLUDED.token,
                username = EXCLUDED.username,
                enabled = EXCLUDED.enabled,
                updated_at = NOW()
            "#,
        )
        .bind(&binding.id)
        .bind(&binding.bot_id)
        .bind(binding.platform.as_str())
        .bind(&binding.token)
        .bind(&binding.username)
        .bind(binding.enabled)
        .bind(binding.created_at)
        .bind(binding.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_binding(&self, platform: Platform, binding_id: &str) -> Result<Option<PlatformBinding>> {
        let binding = sqlx::query_as::<_, PlatformBinding>(
            "SELECT * FROM platform_bindings WHERE id = $1 AND platform = $2",
        )
        .bind(binding_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(binding)
    }

    async fn bindings_for_bot(&self, bot_id: &str) -> Result<Vec<PlatformBinding>> {
        let bindings = sqlx::query_as::<_, PlatformBinding>(
            "SELECT * FROM platform_bindings WHERE bot_id = $1 ORDER BY platform",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bindings)
    }

    async fn set_env_var(&self, bot_id: &str, key: &str, value: &str) -> Result<EnvironmentVar> {
        let var = sqlx::query_as::<_, EnvironmentVar>(
            r#"
            INSERT INTO environment_vars (id, bot_id, key, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (bot_id, key) DO UPDATE SET value = EXCLUDED.value
            RETURNING id, bot_id, key, value
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(bot_id)
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        Ok(var)
    }

    async fn env_vars(&self, bot_id: &str) -> Result<Vec<EnvironmentVar>> {
        let vars = sqlx::query_as::<_, EnvironmentVar>(
            "SELECT id, bot_id, key, value FROM environment_vars WHERE bot_id = $1 ORDER BY key",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(vars)
    }

    async fn insert_state(&self, state: &State) -> Result<()> {
        sqlx::query("INSERT INTO states (id, bot_id, name) VALUES ($1, $2, $3)")
            .bind(&state.id)
            .bind(&state.bot_id)
            .bind(&state.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_state(&self, state_id: &str) -> Result<Option<State>> {
        let state = sqlx::query_as::<_, State>("SELECT id, bot_id, name FROM states WHERE id = $1")
            .bind(state_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state)
    }

    async fn state_by_name(&self, bot_id: &str, name: &str) -> Result<Option<State>> {
        let state = sqlx::query_as::<_, State>(
            "SELECT id, bot_id, name FROM states WHERE bot_id = $1 AND name = $2",
        )
        .bind(bot_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn delete_state(&self, state_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_states WHERE state_id = $1")
            .bind(state_id)
            .fetch_one(&mut *tx)
            .await?;
        if in_use > 0 {
            tx.rollback().await?;
            return Err(EngineError::Integrity(format!(
                "state {state_id} is the current state of {in_use} chat(s)"
            )));
        }
        let referencing: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM handlers h
            WHERE h.target_state_id = $1
               OR EXISTS (SELECT 1 FROM handler_source_states s WHERE s.handler_id = h.id AND s.state_id = $1)
            "#,
        )
        .bind(state_id)
        .fetch_one(&mut *tx)
        .await?;
        if referencing > 0 {
            tx.rollback().await?;
            return Err(EngineError::Integrity(format!(
                "state {state_id} is referenced by {referencing} handler(s)"
            )));
        }
        sqlx::query("DELETE FROM states WHERE id = $1")
            .bind(state_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_handler(&self, handler: &Handler) -> Result<Handler> {
        let mut tx = self.pool.begin().await?;
        write_response(&mut tx, &handler.response).await?;
        if let Some(request) = &handler.request {
            write_request(&mut tx, request).await?;
        }

        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO handlers (id, bot_id, name, pattern, priority, enabled, target_state_id, request_id, response_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING seq
            "#,
        )
        .bind(&handler.id)
        .bind(&handler.bot_id)
        .bind(&handler.name)
        .bind(&handler.pattern)
        .bind(handler.priority)
        .bind(handler.enabled)
        .bind(&handler.target_state)
        .bind(handler.request.as_ref().map(|r| r.id.as_str()))
        .bind(&handler.response.id)
        .fetch_one(&mut *tx)
        .await?;

        write_source_states(&mut tx, &handler.id, &handler.source_states).await?;
        tx.commit().await?;

        debug!(handler_id = handler.id, seq = seq, "Handler stored");
        let mut stored = handler.clone();
        stored.seq = seq;
        Ok(stored)
    }

    async fn update_handler(&self, handler: &Handler) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_response(&mut tx, &handler.response).await?;
        if let Some(request) = &handler.request {
            write_request(&mut tx, request).await?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE handlers
            SET name = $2, pattern = $3, priority = $4, enabled = $5,
                target_state_id = $6, request_id = $7, response_id = $8
            WHERE id = $1
            "#,
        )
        .bind(&handler.id)
        .bind(&handler.name)
        .bind(&handler.pattern)
        .bind(handler.priority)
        .bind(handler.enabled)
        .bind(&handler.target_state)
        .bind(handler.request.as_ref().map(|r| r.id.as_str()))
        .bind(&handler.response.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(EngineError::not_found(format!("handler {}", handler.id)));
        }

        write_source_states(&mut tx, &handler.id, &handler.source_states).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn handlers_for_bot(&self, bot_id: &str) -> Result<Vec<Handler>> {
        let rows = sqlx::query_as::<_, HandlerRow>(&format!(
            "{HANDLER_SELECT} WHERE h.bot_id = $1 ORDER BY h.priority DESC, h.seq ASC"
        ))
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_handlers(rows).await
    }

    async fn count_handlers(&self, bot_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handlers WHERE bot_id = $1")
            .bind(bot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        // handlers.request_id is nulled by the foreign key.
        sqlx::query("DELETE FROM requests WHERE id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_chat_state(&self, bot_id: &str, identity: &ChatIdentity) -> Result<Option<ChatState>> {
        let chat_state = sqlx::query_as::<_, ChatState>(
            "SELECT * FROM chat_states WHERE bot_id = $1 AND chat_id = $2 AND user_id = $3",
        )
        .bind(bot_id)
        .bind(&identity.chat_id)
        .bind(identity.user_key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(chat_state)
    }

    async fn upsert_chat_state(
        &self,
        bot_id: &str,
        identity: &ChatIdentity,
        state_id: &str,
        contribution: &Value,
    ) -> Result<Transition> {
        let row = sqlx::query_as::<_, UpsertRow>(
            r#"
            INSERT INTO chat_states (id, bot_id, chat_id, user_id, state_id, context)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (bot_id, chat_id, user_id) DO UPDATE
            SET state_id = EXCLUDED.state_id,
                context = chat_states.context || EXCLUDED.context,
                updated_at = NOW()
            WHERE chat_states.state_id <> EXCLUDED.state_id
               OR (chat_states.context || EXCLUDED.context) <> chat_states.context
            RETURNING id, bot_id, chat_id, user_id, state_id, context, created_at, updated_at,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(bot_id)
        .bind(&identity.chat_id)
        .bind(identity.user_key())
        .bind(state_id)
        .bind(contribution)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(UpsertRow { chat_state, inserted: true }) => Ok(Transition::Created(chat_state)),
            Some(UpsertRow { chat_state, inserted: false }) => Ok(Transition::Updated(chat_state)),
            None => {
                let existing = self
                    .get_chat_state(bot_id, identity)
                    .await?
                    .ok_or_else(|| EngineError::not_found(format!("chat state for {}", identity.chat_id)))?;
                Ok(Transition::Unchanged(existing))
            }
        }
    }

    async fn count_chat_states(&self, bot_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_states WHERE bot_id = $1")
            .bind(bot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_hook(&self, hook: &Hook, response: &ResponseSpec) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_response(&mut tx, response).await?;
        sqlx::query(
            r#"
            INSERT INTO hooks (id, bot_id, name, key, enabled, response_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&hook.id)
        .bind(&hook.bot_id)
        .bind(&hook.name)
        .bind(&hook.key)
        .bind(hook.enabled)
        .bind(&hook.response_id)
        .bind(hook.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_hook(&self, hook: &Hook) -> Result<()> {
        let updated = sqlx::query("UPDATE hooks SET name = $2, key = $3, enabled = $4 WHERE id = $1")
            .bind(&hook.id)
            .bind(&hook.name)
            .bind(&hook.key)
            .bind(hook.enabled)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("hook {}", hook.id)));
        }
        Ok(())
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>> {
        let hook = sqlx::query_as::<_, Hook>("SELECT * FROM hooks WHERE id = $1")
            .bind(hook_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hook)
    }

    async fn hook_by_key(&self, key: &str) -> Result<Option<Hook>> {
        let hook = sqlx::query_as::<_, Hook>("SELECT * FROM hooks WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hook)
    }

    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseSpec>> {
        let response = sqlx::query_as::<_, ResponseSpec>(
            "SELECT id, text_template, keyboard_template FROM responses WHERE id = $1",
        )
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(response)
    }

    async fn insert_recipient(&self, recipient: &Recipient) -> Result<()> {
        sqlx::query(
            "INSERT INTO recipients (id, hook_id, platform, chat_id, name) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&recipient.id)
        .bind(&recipient.hook_id)
        .bind(recipient.platform.as_str())
        .bind(&recipient.chat_id)
        .bind(&recipient.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recipients(&self, hook_id: &str) -> Result<Vec<Recipient>> {
        let recipients = sqlx::query_as::<_, Recipient>(
            "SELECT id, hook_id, platform, chat_id, name FROM recipients WHERE hook_id = $1 ORDER BY name",
        )
        .bind(hook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(recipients)
    }
}
