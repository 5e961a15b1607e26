use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::types::anon_ip;
use crate::session::UserSession;

/// One event line from the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookEvent {
    pub webhook_name: String,
    pub user_id: String,
    pub email: String,
    pub ip_address: String,
    pub timezone: String,
    pub first_name: String,
    pub last_name: String,
    /// Keys not named above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WebhookEvent {
    /// The session a webhook handler runs as.
    pub fn session(&self) -> UserSession {
        UserSession {
            user_sub: self.user_id.clone(),
            user_email: self.email.clone(),
            anon_ip: anon_ip(&self.ip_address),
            timezone: self.timezone.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_keys_are_kept() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"webhookName":"REGISTER","userId":"u1","email":"a@b.test","ipAddress":"10.0.0.7","code":"123"}"#,
        )
        .unwrap();
        assert_eq!(event.webhook_name, "REGISTER");
        assert_eq!(event.extra["code"], "123");

        let session = event.session();
        assert_eq!(session.user_sub, "u1");
        assert_eq!(session.anon_ip, "10.0.0.0");
    }
}
