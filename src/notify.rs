/// Fire-and-forget chat-bot notification sink. Delivery failures are logged
/// and swallowed — a dropped notification is never worth retrying under the
/// master's rate budget, and must never fail the trade operation that
/// triggered it.
pub struct NotificationSink {
    http: reqwest::Client,
    endpoint: String,
}

impl NotificationSink {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    /// Posts `message` (HTML-flavored markup allowed) to the configured
    /// endpoint. Spawns its own task so callers never wait on delivery.
    pub fn notify(&self, message: String) {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let result = http
                .post(&endpoint)
                .json(&serde_json::json!({ "text": message, "parse_mode": "HTML" }))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => log::warn!("[NOTIFY] non-success response: {}", resp.status()),
                Err(e) => log::warn!("[NOTIFY] failed to deliver notification: {e}"),
            }
        });
    }
}
