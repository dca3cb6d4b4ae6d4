#![forbid(unsafe_code)]

use std::sync::Arc;

use log::{error, info, warn};

use crate::busya::provider::{CompletionProvider, CompletionRequest};
use crate::busya::resolver::ResponseResolver;
use crate::utils::errors::ChatError;

// ***************************************************************************
//                               Chat Settings
// ***************************************************************************
/// Fixed inputs of every provider call.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

// ***************************************************************************
//                                Chat Reply
// ***************************************************************************
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// Reported under the `response` key.
    Response(String),
    /// Reported under the `error` key.
    Error(String),
}

/** Everything the http layer needs to answer a chat request. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub status: u16,
    pub body: ReplyBody,
    pub is_male_voice: bool,
}

impl ChatReply {
    fn success(text: String, is_male_voice: bool) -> Self {
        Self {status: 200, body: ReplyBody::Response(text), is_male_voice}
    }

    fn failure(err: ChatError, is_male_voice: bool) -> Self {
        let body = match err {
            ChatError::Validation => ReplyBody::Error(err.to_string()),
            _ => ReplyBody::Response(err.to_string()),
        };
        Self {status: err.status_code(), body, is_male_voice}
    }
}

// ***************************************************************************
//                               Chat Gateway
// ***************************************************************************
pub struct ChatGateway {
    resolver: ResponseResolver,
    provider: Option<Arc<dyn CompletionProvider>>,
    settings: ChatSettings,
}

impl ChatGateway {
    pub fn new(resolver: ResponseResolver, provider: Option<Arc<dyn CompletionProvider>>,
               settings: ChatSettings) -> Self {
        Self {resolver, provider, settings}
    }

    pub fn is_male_voice(&self) -> bool {
        self.resolver.voice().is_male()
    }

    // -----------------------------------------------------------------------
    // handle_chat:
    // -----------------------------------------------------------------------
    /** Answer one chat message.  The message is None when the request had no
     * string message.  Every reply carries the voice state as it stands after
     * the message was processed.
     */
    pub async fn handle_chat(&self, message: Option<&str>) -> ChatReply {
        match self.process(message).await {
            Ok(text) => ChatReply::success(text, self.is_male_voice()),
            Err(e) => ChatReply::failure(e, self.is_male_voice()),
        }
    }

    async fn process(&self, message: Option<&str>) -> Result<String, ChatError> {
        // Blank messages are rejected before anything else happens.
        let message = match message.map(str::trim) {
            Some(m) if !m.is_empty() => m,
            _ => return Err(ChatError::Validation),
        };

        // Canned replies.
        if let Some(canned) = self.resolver.resolve(message) {
            info!("Answered with a canned reply.");
            return Ok(canned);
        }

        // Provider replies.
        let provider = match &self.provider {
            Some(p) => p,
            None => {
                warn!("No completion provider configured, cannot answer message.");
                return Err(ChatError::Configuration);
            }
        };

        let req = CompletionRequest {
            system_prompt: &self.settings.system_prompt,
            user_message: message,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        match provider.complete(&req).await {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) => {
                error!("Error processing chat request: {}", e);
                if e.is_quota_exceeded() {Err(ChatError::QuotaExceeded)} else {Err(ChatError::TransientProvider)}
            }
        }
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::busya::phrases::PhraseTable;
    use crate::busya::provider::ProviderError;
    use crate::busya::resolver::{MatchMode, VoiceState};

    // Records the user messages it receives and answers with a fixed outcome.
    struct FakeProvider {
        calls: Mutex<Vec<String>>,
        outcome: fn() -> Result<String, ProviderError>,
    }

    impl FakeProvider {
        fn new(outcome: fn() -> Result<String, ProviderError>) -> Arc<Self> {
            Arc::new(Self {calls: Mutex::new(Vec::new()), outcome})
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionProvider for FakeProvider {
        async fn complete(&self, req: &CompletionRequest<'_>) -> Result<String, ProviderError> {
            assert_eq!(req.temperature, 0.8);
            assert_eq!(req.max_tokens, 500);
            assert_eq!(req.system_prompt, "persona");
            self.calls.lock().unwrap().push(req.user_message.to_string());
            (self.outcome)()
        }
    }

    fn gateway(provider: Option<Arc<dyn CompletionProvider>>) -> ChatGateway {
        let resolver = ResponseResolver::new(PhraseTable::default(), MatchMode::Substring,
                                             Arc::new(VoiceState::new()));
        let settings = ChatSettings {system_prompt: "persona".to_string(), temperature: 0.8, max_tokens: 500};
        ChatGateway::new(resolver, provider, settings)
    }

    fn response_text(reply: &ChatReply) -> &str {
        match &reply.body {
            ReplyBody::Response(s) => s,
            ReplyBody::Error(s) => panic!("unexpected error body: {}", s),
        }
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let gw = gateway(None);
        for msg in [Some(""), Some("   \n\t"), None] {
            let reply = gw.handle_chat(msg).await;
            assert_eq!(reply.status, 400);
            assert_eq!(reply.body, ReplyBody::Error("Пустое сообщение".to_string()));
            assert!(!reply.is_male_voice);
        }

        // The voice state is reported, whatever it is.
        gw.handle_chat(Some("смени голос")).await;
        let reply = gw.handle_chat(Some(" ")).await;
        assert_eq!(reply.status, 400);
        assert!(reply.is_male_voice);
    }

    #[tokio::test]
    async fn canned_reply_skips_provider() {
        let fake = FakeProvider::new(|| Ok("generated".to_string()));
        let gw = gateway(Some(fake.clone()));
        let reply = gw.handle_chat(Some("Кто ты?")).await;
        assert_eq!(reply.status, 200);
        assert!(response_text(&reply).starts_with("Приветик! Я — Busya-AI"));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn voice_toggle_reports_new_state() {
        let gw = gateway(None);
        let first = gw.handle_chat(Some("смени голос")).await;
        assert_eq!(first.status, 200);
        assert!(first.is_male_voice);
        assert!(response_text(&first).contains("мужской"));

        let second = gw.handle_chat(Some("смени голос")).await;
        assert!(!second.is_male_voice);
        assert!(response_text(&second).contains("женский"));
    }

    #[tokio::test]
    async fn unmatched_message_goes_to_provider() {
        let fake = FakeProvider::new(|| Ok("  Привет! ^_^\n".to_string()));
        let gw = gateway(Some(fake.clone()));
        let reply = gw.handle_chat(Some("  hello  ")).await;
        assert_eq!(reply, ChatReply {
            status: 200,
            body: ReplyBody::Response("Привет! ^_^".to_string()),
            is_male_voice: false,
        });
        assert_eq!(fake.calls(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn missing_provider_is_not_configured() {
        let gw = gateway(None);
        let reply = gw.handle_chat(Some("hello")).await;
        assert_eq!(reply.status, 500);
        assert_eq!(response_text(&reply), "⚠️ API ключ не настроен. Добавь его в .env!");
    }

    #[tokio::test]
    async fn quota_failure_is_mapped() {
        let fake = FakeProvider::new(|| Err(ProviderError::Api {
            status: 429,
            body: "Traceback: secret upstream detail".to_string(),
        }));
        let gw = gateway(Some(fake));
        let reply = gw.handle_chat(Some("hello")).await;
        assert_eq!(reply.status, 500);
        assert_eq!(response_text(&reply), "⚠️ Лимит OpenAI превышен. Попробуй позже или проверь свой план.");
        assert!(!response_text(&reply).contains("Traceback"));
    }

    #[tokio::test]
    async fn other_failures_are_generic() {
        let fake = FakeProvider::new(|| Err(ProviderError::Timeout(Duration::from_secs(30))));
        let gw = gateway(Some(fake));
        let reply = gw.handle_chat(Some("hello")).await;
        assert_eq!(reply.status, 500);
        assert_eq!(response_text(&reply), "Ой, ошибочка! Попробуй чуть позже ^_^");

        let fake = FakeProvider::new(|| Err(ProviderError::EmptyCompletion));
        let reply = gateway(Some(fake)).handle_chat(Some("hello")).await;
        assert_eq!(response_text(&reply), "Ой, ошибочка! Попробуй чуть позже ^_^");
    }
}
