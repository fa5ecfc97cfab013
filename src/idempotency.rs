use crate::models::EnqueueResponse;
use redis::AsyncCommands;

// Replay cache for `Idempotency-Key` on job submission. Redis when
// configured, the in-process map in main.rs otherwise; failures here must
// never fail the request.

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<EnqueueResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &EnqueueResponse,
    ttl_secs: usize,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs as u64).await;
    }
}
